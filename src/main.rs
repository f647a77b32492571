use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{info, warn};
use std::io;
use std::path::Path;
use std::sync::Arc;

use scripture_rag::config::AppConfig;
use scripture_rag::database::{QdrantIndex, VectorIndex};
use scripture_rag::document::load_documents;
use scripture_rag::memory_index::MemoryIndex;
use scripture_rag::openai::OpenAiClient;
use scripture_rag::rag::RagEngine;
use scripture_rag::retrieval::Query;
use scripture_rag::server;
use scripture_rag::session::{MemorySessionStore, SessionStore, SupabaseSessionStore};

/// Question answering over Bhagavad Gita episode transcripts, backed by OpenAI and Qdrant
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Keep vectors in process memory instead of Qdrant
    #[arg(long, global = true)]
    memory_index: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chunk, embed and index a document (episode JSON, text or PDF)
    Ingest {
        path: String,
        /// Chapter used for episodes that don't name one
        #[arg(long, default_value_t = 1)]
        chapter: u32,
        /// Drop existing vectors first
        #[arg(long)]
        recreate: bool,
    },
    /// Answer a single question
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<u64>,
        /// Conversation id for history
        #[arg(long)]
        session: Option<String>,
    },
    /// Interactive question loop; type `exit` to quit
    Chat {
        #[arg(long)]
        session: Option<String>,
    },
    /// Show the closest passages without generating an answer
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<u64>,
    },
    /// Report index status
    Health,
    /// Start the HTTP server
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let engine = build_engine(&config, cli.memory_index)?;

    match cli.command {
        Command::Ingest {
            path,
            chapter,
            recreate,
        } => {
            if !Path::new(&path).exists() {
                return Err(anyhow::anyhow!("File not found: {}", path));
            }
            let documents = load_documents(&path, chapter).context("Failed to load documents")?;
            info!("Loaded {} documents from {}", documents.len(), path);

            let report = engine
                .ingest(&documents, recreate)
                .await
                .context("Ingestion failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ask {
            question,
            top_k,
            session,
        } => {
            let query = Query::new(question)
                .with_top_k(top_k)
                .with_conversation(session);
            let reply = engine.chat(query).await?;
            println!("{}", reply.answer);
            if !reply.sources.is_empty() {
                println!("\nSources: {}", reply.source_ids().join(", "));
            }
        }
        Command::Chat { session } => {
            engine
                .run_query_loop(io::stdin().lock(), io::stdout(), session)
                .await
                .context("Error in query loop")?;
        }
        Command::Search { query, top_k } => {
            let results = engine.search(&Query::new(query).with_top_k(top_k)).await?;
            for (i, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {}\n{}\n",
                    i + 1,
                    result.score,
                    result.entry.id,
                    result.entry.metadata.text
                );
            }
        }
        Command::Health => {
            println!("{}", serde_json::to_string_pretty(&engine.health().await)?);
        }
        Command::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.server_addr.clone());
            server::serve(Arc::new(engine), &addr, config.ingest_dir.clone())
                .await
                .context("Server error")?;
        }
    }

    Ok(())
}

fn build_engine(config: &AppConfig, memory_index: bool) -> Result<RagEngine> {
    let openai = Arc::new(OpenAiClient::new(config.openai.clone(), config.retry.clone()));

    let index: Arc<dyn VectorIndex> = if memory_index {
        Arc::new(MemoryIndex::new(
            config.qdrant.collection.clone(),
            config.qdrant.vector_size as usize,
        ))
    } else {
        Arc::new(
            QdrantIndex::new(config.qdrant.clone(), config.retry.clone())
                .context("Failed to initialize Qdrant client")?,
        )
    };

    let sessions: Arc<dyn SessionStore> = match &config.supabase {
        Some(supabase) => Arc::new(SupabaseSessionStore::new(
            supabase.clone(),
            config.retry.clone(),
        )),
        None => {
            warn!("Supabase is not configured, conversation history is kept in memory");
            Arc::new(MemorySessionStore::new())
        }
    };

    Ok(RagEngine::new(
        openai.clone(),
        index,
        openai,
        sessions,
        config.rag.clone(),
    ))
}
