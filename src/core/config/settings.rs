use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment,
    parse_fraction, parse_persistence_backend, parse_u16, parse_u32, parse_u64,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    ApiSettings, ConfigError, CorsSettings, DatabaseSettings, GradingSettings, MlServiceSettings,
    PersistenceBackend, PersistenceSettings, RedisSettings, RuntimeSettings, SecuritySettings,
    ServerHost, ServerPort, ServerSettings, Settings, TelemetrySettings, WorkerSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("GRADING_HOST", "0.0.0.0");
        let port = env_or_default("GRADING_PORT", "8000");

        let environment =
            parse_environment(env_optional("GRADING_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("GRADING_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Answer Sheet Grading API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => load_or_create_secret_key(),
        };
        let access_token_expire_minutes = parse_u64(
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            env_or_default("ACCESS_TOKEN_EXPIRE_MINUTES", "10080"),
        )?;
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let backend = parse_persistence_backend(env_optional("PERSISTENCE_BACKEND"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "grading");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "grading_db");
        let database_url = env_optional("DATABASE_URL");
        let max_connections =
            parse_u32("DATABASE_MAX_CONNECTIONS", env_or_default("DATABASE_MAX_CONNECTIONS", "20"))?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let ml_base_url = env_or_default("ML_SERVICE_URL", "http://localhost:8001");
        let ml_api_key = env_or_default("ML_SERVICE_API_KEY", "");
        let ml_request_timeout_seconds = parse_u64(
            "ML_REQUEST_TIMEOUT_SECONDS",
            env_or_default("ML_REQUEST_TIMEOUT_SECONDS", "30"),
        )?;
        let ml_training_timeout_seconds = parse_u64(
            "ML_TRAINING_TIMEOUT_SECONDS",
            env_or_default("ML_TRAINING_TIMEOUT_SECONDS", "900"),
        )?;

        let review_threshold =
            parse_fraction("REVIEW_THRESHOLD", env_or_default("REVIEW_THRESHOLD", "0.75"))?;
        let min_training_annotations = parse_u32(
            "MIN_TRAINING_ANNOTATIONS",
            env_or_default("MIN_TRAINING_ANNOTATIONS", "5"),
        )?;
        let sheet_concurrency = parse_u32(
            "GRADING_SHEET_CONCURRENCY",
            env_or_default("GRADING_SHEET_CONCURRENCY", "4"),
        )? as usize;
        let report_cache_ttl_seconds = parse_u64(
            "REPORT_CACHE_TTL_SECONDS",
            env_or_default("REPORT_CACHE_TTL_SECONDS", "300"),
        )?;

        let poll_interval_seconds = parse_u64(
            "WORKER_POLL_INTERVAL_SECONDS",
            env_or_default("WORKER_POLL_INTERVAL_SECONDS", "2"),
        )?;
        let sweep_interval_seconds = parse_u64(
            "STALE_SWEEP_INTERVAL_SECONDS",
            env_or_default("STALE_SWEEP_INTERVAL_SECONDS", "300"),
        )?;
        let training_stale_after_seconds = parse_u64(
            "TRAINING_STALE_AFTER_SECONDS",
            env_or_default("TRAINING_STALE_AFTER_SECONDS", "3600"),
        )?;
        let grading_stale_after_seconds = parse_u64(
            "GRADING_STALE_AFTER_SECONDS",
            env_or_default("GRADING_STALE_AFTER_SECONDS", "1800"),
        )?;

        let log_level = env_or_default("GRADING_LOG_LEVEL", "info");
        let json = env_optional("GRADING_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, access_token_expire_minutes, algorithm },
            cors: CorsSettings { origins: cors_origins },
            persistence: PersistenceSettings { backend },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            ml: MlServiceSettings {
                base_url: ml_base_url,
                api_key: ml_api_key,
                request_timeout_seconds: ml_request_timeout_seconds,
                training_timeout_seconds: ml_training_timeout_seconds,
            },
            grading: GradingSettings {
                review_threshold,
                min_training_annotations,
                sheet_concurrency,
                report_cache_ttl_seconds,
            },
            worker: WorkerSettings {
                poll_interval_seconds,
                sweep_interval_seconds,
                training_stale_after_seconds,
                grading_stale_after_seconds,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn persistence(&self) -> &PersistenceSettings {
        &self.persistence
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn ml(&self) -> &MlServiceSettings {
        &self.ml
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.grading.min_training_annotations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MIN_TRAINING_ANNOTATIONS",
                value: "0".to_string(),
            });
        }

        if self.grading.sheet_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_SHEET_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if self.worker.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "WORKER_POLL_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.worker.sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "STALE_SWEEP_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.ml.request_timeout_seconds == 0 || self.ml.training_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ML_REQUEST_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.persistence.backend == PersistenceBackend::Postgres
            && self.database.database_url.is_none()
            && self.database.postgres_password.is_empty()
        {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if env_optional("ML_SERVICE_URL").is_none() {
            return Err(ConfigError::MissingSecret("ML_SERVICE_URL"));
        }
        if env_optional("SECRET_KEY").is_none() {
            return Err(ConfigError::MissingSecret("SECRET_KEY"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn load_applies_grading_defaults() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::remove_var("REVIEW_THRESHOLD");
        std::env::remove_var("MIN_TRAINING_ANNOTATIONS");

        let settings = Settings::load().expect("settings");

        assert_eq!(settings.grading().review_threshold, 0.75);
        assert_eq!(settings.grading().min_training_annotations, 5);
        assert_eq!(settings.persistence().backend, PersistenceBackend::Memory);
    }

    #[tokio::test]
    async fn load_rejects_zero_sheet_concurrency() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("GRADING_SHEET_CONCURRENCY", "0");

        let result = Settings::load();
        std::env::remove_var("GRADING_SHEET_CONCURRENCY");

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "GRADING_SHEET_CONCURRENCY", .. })
        ));
    }

    #[tokio::test]
    async fn strict_config_requires_ml_service_url() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("GRADING_STRICT_CONFIG", "1");
        std::env::remove_var("ML_SERVICE_URL");

        let result = Settings::load();
        std::env::set_var("GRADING_STRICT_CONFIG", "0");

        assert!(matches!(result, Err(ConfigError::MissingSecret("ML_SERVICE_URL"))));
    }
}
