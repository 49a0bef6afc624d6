use sqlx::Row;

fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();

    std::env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty())
}

#[tokio::test]
async fn migrations_apply_and_tables_exist() -> anyhow::Result<()> {
    let Some(database_url) = database_url() else {
        eprintln!("DATABASE_URL is not set; skipping migrations smoke test");
        return Ok(());
    };

    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url).await?;

    let migrations_dir =
        std::env::var("GRADING_MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(&migrations_dir)).await?;
    migrator.run(&pool).await?;

    let tables = [
        "templates",
        "regions",
        "sheets",
        "annotations",
        "training_sessions",
        "models",
        "grading_jobs",
        "grading_job_sheets",
        "grading_results",
    ];

    for table in tables {
        let row = sqlx::query("SELECT to_regclass($1)::text").bind(table).fetch_one(&pool).await?;
        let regclass: Option<String> = row.try_get(0)?;
        assert!(regclass.is_some(), "expected table {table} to exist after migrations");
    }

    let row = sqlx::query("SELECT count(*) FROM pg_type WHERE typname = ANY($1)")
        .bind(vec!["questiontype", "sheetstatus", "correctness", "runstatus"])
        .fetch_one(&pool)
        .await?;
    let enum_count: i64 = row.try_get(0)?;
    assert_eq!(enum_count, 4);

    Ok(())
}
