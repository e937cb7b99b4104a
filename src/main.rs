use std::{collections::BTreeMap, sync::Arc};

use clap::Parser;
use pagebert::{
    ConfigDb,
    DataDir,
    DocumentId,
    Engine,
    EngineConfig,
    EnginePool,
    EmbeddingEngine,
    Error,
    ModelManager,
    Result,
    config::{self, DEFAULT_MODEL_ID, MODEL_ENV_VAR},
    item::Collection,
    item_store::ItemStore,
    search::{self, SearchRequest},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, ModelAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("PAGEBERT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    match cli.command {
        Command::Model { action } => {
            return model_command(&config_db, cli.model.as_deref(), action);
        }
        Command::Config { action } => {
            return config_command(&config_db, action);
        }
        _ => {}
    }

    let mut config = EngineConfig::load(&config_db)?;
    if let Some(model) = cli.model {
        config.model_id = model;
    }
    let engine = open_engine(&data_dir, config_db, config)?;

    match cli.command {
        Command::Search(args) => {
            let request = SearchRequest {
                query: args.query,
                mode: args.mode,
                top_k: args.count.unwrap_or(engine.config().default_top_k),
                min_score: args.min_score,
            };
            let results = engine.search_with(&request).await?;

            if args.json {
                search::format_json(&results, &request.query, request.mode)?;
            } else {
                search::format_human(&results);
            }
        }
        Command::Documents(args) => {
            cmd_documents(&engine, args.json).await?;
        }
        Command::Status(args) => {
            cmd_status(&engine, &data_dir, args.json).await?;
        }
        Command::Remove { doc_id } => {
            let known = engine.storage().list_records().await?;
            let doc_id = DocumentId::resolve(&doc_id, known.iter().map(|r| r.doc_id))?;
            if !engine.coordinator().delete_document(doc_id).await? {
                return Err(Error::NotFound {
                    kind: "document",
                    name: doc_id.to_string(),
                });
            }
            println!("Removed document {doc_id}");
        }
        Command::Model { .. } | Command::Config { .. } | Command::Completions(_) => {}
    }

    Ok(())
}

/// One lazily-loaded model handle per accelerator.
fn open_engine(data_dir: &DataDir, config_db: ConfigDb, config: EngineConfig) -> Result<Engine> {
    let handles: Vec<Box<dyn EmbeddingEngine>> = (0..config.accelerators)
        .map(|_| {
            Box::new(ModelManager::new(config.model_id.clone(), config.device))
                as Box<dyn EmbeddingEngine>
        })
        .collect();
    let pool = Arc::new(EnginePool::new(handles)?);
    let items = ItemStore::open(&data_dir.items_db())?;
    Ok(Engine::new(config_db, items, pool, config))
}

fn model_command(
    config_db: &ConfigDb,
    cli_model: Option<&str>,
    action: ModelAction,
) -> Result<()> {
    match action {
        ModelAction::Show { json } => {
            let env_model = std::env::var(MODEL_ENV_VAR).ok();
            let stored = config_db.get_setting(config::SETTING_MODEL)?;
            let (model, source) = if let Some(m) = cli_model {
                (m.to_string(), "cli")
            } else if let Some(m) = stored.clone() {
                (m, "config")
            } else if let Some(m) = env_model.clone() {
                (m, "env")
            } else {
                (DEFAULT_MODEL_ID.to_string(), "default")
            };

            if json {
                let value = serde_json::json!({
                    "model": model,
                    "source": source,
                    "env": env_model,
                    "stored": stored,
                });
                println!("{value}");
            } else {
                println!("Model: {model} ({source})");
            }
        }
        ModelAction::Set { model } => {
            EngineConfig::validate_setting(config::SETTING_MODEL, &model)?;
            config_db.set_setting(config::SETTING_MODEL, &model)?;
            println!("Default model set to {model}");
        }
        ModelAction::Clear => {
            if config_db.remove_setting(config::SETTING_MODEL)? {
                println!("Cleared stored model setting");
            } else {
                println!("No stored model setting");
            }
        }
    }
    Ok(())
}

fn config_command(config_db: &ConfigDb, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let config = EngineConfig::load(config_db)?;
            let stored: BTreeMap<String, String> =
                config_db.list_settings()?.into_iter().collect();
            let resolved: Vec<(&str, serde_json::Value)> = vec![
                (config::SETTING_MODEL, config.model_id.into()),
                (config::SETTING_DEVICE, config.device.to_string().into()),
                (config::SETTING_PRECISION, config.precision.to_string().into()),
                (config::SETTING_CANDIDATE_LIMIT, config.candidate_limit.into()),
                (config::SETTING_TOP_K, config.default_top_k.into()),
                (
                    config::SETTING_STORAGE_TIMEOUT_MS,
                    (config.storage_timeout.as_millis() as u64).into(),
                ),
                (config::SETTING_WORKERS, config.workers.into()),
                (config::SETTING_ACCELERATORS, config.accelerators.into()),
            ];

            if json {
                let resolved: serde_json::Map<String, serde_json::Value> = resolved
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                println!("{}", serde_json::json!({ "resolved": resolved, "stored": stored }));
            } else {
                for (key, value) in &resolved {
                    let marker = if stored.contains_key(*key) { "*" } else { " " };
                    println!("{marker} {key} = {value}");
                }
            }
        }
        ConfigAction::Set { key, value } => {
            EngineConfig::validate_setting(&key, &value)?;
            config_db.set_setting(&key, value.trim())?;
            println!("Set {key} = {}", value.trim());
        }
    }
    Ok(())
}

async fn cmd_documents(engine: &Engine, json: bool) -> Result<()> {
    let records = engine.storage().list_records().await?;

    if json {
        let out = serde_json::to_string(&records)
            .map_err(|e| Error::Validation(format!("failed to encode documents: {e}")))?;
        println!("{out}");
    } else if records.is_empty() {
        println!("No documents registered.");
    } else {
        for r in &records {
            let partial = if r.partial { " (partial)" } else { "" };
            println!(
                "{}\t{}\t{}{partial}\t{} pages\t{} chunks\t{}",
                r.doc_id,
                r.filename,
                r.stage,
                r.page_count,
                r.chunk_count,
                r.date_added.format("%Y-%m-%d %H:%M"),
            );
            if let Some(reason) = &r.failure_reason {
                println!("\t{reason}");
            }
        }
    }
    Ok(())
}

async fn cmd_status(engine: &Engine, data_dir: &DataDir, json: bool) -> Result<()> {
    let records = engine.storage().list_records().await?;
    let stats = engine.get_storage_stats().await?;
    let mut by_stage: BTreeMap<&'static str, usize> = BTreeMap::new();
    for r in &records {
        *by_stage.entry(r.stage.as_str()).or_default() += 1;
    }

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "data_dir_source": data_dir.source(),
            "model": engine.config().model_id,
            "documents": records.len(),
            "stages": by_stage,
            "storage": stats,
        });
        println!("{value}");
    } else {
        println!(
            "Data directory: {} ({})",
            data_dir.root().display(),
            data_dir.source()
        );
        println!("Model: {}", engine.config().model_id);
        println!("Documents: {}", records.len());
        for (stage, count) in &by_stage {
            println!("  {stage}: {count}");
        }
        for collection in Collection::ALL {
            let cs = stats.collection(collection);
            let dim = cs
                .dimension
                .map_or_else(|| "-".to_string(), |d| d.to_string());
            println!(
                "Collection {collection}: {} items, dim {dim}, {} -> {} bytes",
                cs.items, cs.raw_bytes, cs.compressed_bytes
            );
        }
        match stats.compression_ratio {
            Some(ratio) => println!("Compression ratio: {ratio:.2}x"),
            None => println!("Compression ratio: -"),
        }
    }
    Ok(())
}
