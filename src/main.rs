use clap::{Parser, Subcommand};
use schemadb::config::Settings;
use schemadb::sql::{PostgresDialect, QueryCompiler};
use schemadb::storage::{PgPool, SqlStorage, Storage};
use schemadb::validator::{CallerIdentity, QueryDecoder, RawQuery};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "schemadb")]
#[command(about = "SchemaDB - schema-driven query layer for PostgreSQL", long_about = None)]
struct Args {
    /// Directory holding schemadb.toml and .env
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Schema map, overriding the configured one
    #[arg(long)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SQL of a master `find`, without touching the database
    Compile {
        /// Class to query
        #[arg(long = "class")]
        class_name: String,

        /// JSON file with filter, sort, includes, matches, skip and limit
        #[arg(long)]
        query: Option<PathBuf>,
    },
    /// Create or update tables and indexes for the schema
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schemadb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::load(&args.config_dir)?;
    if let Some(schema) = args.schema {
        settings.schema = Some(schema);
    }
    let schema = settings.load_schema()?;

    match args.command {
        Command::Compile { class_name, query } => {
            let mut raw = match query {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => serde_json::json!({}),
            };
            if let Some(object) = raw.as_object_mut() {
                object.insert("className".to_string(), class_name.into());
            }
            let raw: RawQuery = serde_json::from_value(raw)?;

            let schema = schema.prepare()?;
            let identity = CallerIdentity::master();
            let decoded = QueryDecoder::new(&schema, &identity)
                .with_object_id_size(settings.object_id_size)
                .find(raw)?;
            let compiled = QueryCompiler::new(&schema, &PostgresDialect).select(&decoded)?;

            println!("{}", compiled.sql.text);
            for (index, value) in compiled.sql.values.iter().enumerate() {
                println!("${} = {:?}", index + 1, value);
            }
        }
        Command::Migrate => {
            if settings.database_url.is_empty() {
                anyhow::bail!("No database_url configured; set it in schemadb.toml or SCHEMADB_DATABASE_URL");
            }
            let pool = PgPool::new(&settings.database_url, settings.pool_options())?;
            let storage = SqlStorage::new(Arc::new(pool), Arc::new(PostgresDialect)).with_transaction_defaults(
                settings.transaction.default_retry,
                settings.transaction.default_isolation,
            );
            storage.prepare(schema).await?;
            let classes = storage.classes().await?;
            tracing::info!("Migrated {} classes: {}", classes.len(), classes.join(", "));
        }
    }

    Ok(())
}
