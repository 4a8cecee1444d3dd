use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use fs2::FileExt;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lectern::capture::{
    RawPcmSource, Recorder, RecorderEvent, RecorderState, WebmOpusDevice,
};
use lectern::config::AppConfig;
use lectern::lecture::{HttpLectureStore, LectureStore, MemoryLectureStore};
use lectern::openai::{ChatModel, OpenAiClient, SpeechToText};
use lectern::pipeline::Pipeline;
use lectern::remote::{HttpObjectStore, MemoryObjectStore, ObjectStore};
use lectern::server;
use lectern::store::ChunkStore;
use lectern::sync::{AlwaysOnline, SyncEngine, SyncEvent};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Record, sync, and process lecture audio into structured notes"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record audio into the local chunk store
    Record {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Mono s16le PCM input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Input sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// Stop after this many seconds (otherwise runs until input ends)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Upload a session's pending chunks to remote storage
    Sync {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Session to sync
        session_id: String,

        /// User owning the session
        user_id: String,
    },
    /// List sessions that can be resumed
    Sessions {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run the processing pipeline for one session
    Process {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Session to process
        session_id: String,

        /// User owning the session
        user_id: String,
    },
    /// Serve the processing trigger endpoint
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let result = match args.command {
        Command::Record {
            config,
            input,
            sample_rate,
            duration,
        } => run_record(&config, input, sample_rate, duration),
        Command::Sync {
            config,
            session_id,
            user_id,
        } => run_sync(&config, &session_id, &user_id),
        Command::Sessions { config } => run_sessions(&config),
        Command::Process {
            config,
            session_id,
            user_id,
        } => run_process(&config, &session_id, &user_id),
        Command::Serve { config, port } => run_serve(&config, port),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_record(
    config_path: &PathBuf,
    input: Option<PathBuf>,
    sample_rate: u32,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(config_path)?;
    std::fs::create_dir_all(&config.storage.data_dir).map_err(|e| {
        format!(
            "Failed to create data directory '{}': {}",
            config.storage.data_dir.display(),
            e
        )
    })?;

    // One active recording at a time
    let lock_path = config.storage.data_dir.join("record.lock");
    let lock_file = File::create(&lock_path)
        .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "Another instance is already recording. Lock file: {}",
            lock_path.display()
        )
    })?;
    // Lock held until lock_file is dropped (end of function)

    let reader: Box<dyn Read + Send> = match &input {
        Some(path) => Box::new(
            File::open(path)
                .map_err(|e| format!("Failed to open input '{}': {}", path.display(), e))?,
        ),
        None => Box::new(std::io::stdin()),
    };
    match &input {
        Some(path) => println!("Recording from: {}", path.display()),
        None => println!("Recording from stdin"),
    }
    println!("Input: {} Hz mono s16le", sample_rate);

    let source = RawPcmSource::new(reader, sample_rate);
    let mut device = WebmOpusDevice::new(Box::new(source));
    let (events_tx, events_rx) = unbounded();

    let recorder = Recorder::new(&config.store_path());
    let handle = recorder
        .start(&mut device, events_tx)
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    println!("Session ID: {}", handle.session_id());

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                println!("Duration reached, stopping");
                break;
            }
        }
        match events_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(RecorderEvent::ChunkSaved {
                chunk_index, bytes, ..
            }) => println!("Saved chunk {} ({} bytes)", chunk_index, bytes),
            Ok(RecorderEvent::StateChange(RecorderState::Inactive)) => {
                println!("Input ended");
                break;
            }
            Ok(RecorderEvent::StateChange(state)) => println!("Recorder state: {:?}", state),
            Ok(RecorderEvent::Error(e)) => eprintln!("Capture error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let session_id = handle
        .stop()
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    let store = ChunkStore::open(&config.store_path())?;
    if let Some(session) = store.get_session(&session_id)? {
        println!(
            "Recorded {} chunks for session {} (status: {})",
            session.total_chunks,
            session_id,
            session.status.as_str()
        );
    }
    println!("Run 'sync' to upload this session");
    Ok(())
}

fn open_object_store(
    config: &AppConfig,
) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error>> {
    match &config.remote {
        Some(remote) => Ok(Arc::new(HttpObjectStore::new(
            &remote.base_url,
            remote.auth_token.clone(),
        )?)),
        None => {
            println!("No [remote] configured, using simulated in-memory uploads");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
    }
}

fn run_sync(
    config_path: &PathBuf,
    session_id: &str,
    user_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(config_path)?;
    let objects = open_object_store(&config)?;

    let engine = SyncEngine::new(&config.store_path(), objects, Arc::new(AlwaysOnline));
    let (events_tx, events_rx) = unbounded();
    engine.start(session_id, user_id, events_tx)?;
    println!("Syncing session {}", session_id);

    for event in events_rx {
        match event {
            SyncEvent::StatusChange(status) => println!("Sync status: {:?}", status),
            SyncEvent::ChunkUploaded {
                chunk_id,
                uploaded,
                total,
            } => println!("Uploaded {} ({}/{})", chunk_id, uploaded, total),
            SyncEvent::Error { chunk_id, message } => {
                eprintln!("Upload error for {}: {}", chunk_id, message)
            }
            SyncEvent::Complete { session_id } => {
                println!("✓ Session {} fully uploaded", session_id)
            }
        }
    }
    engine.wait();
    Ok(())
}

fn run_sessions(config_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(config_path)?;
    let store = ChunkStore::open(&config.store_path())?;

    let sessions = store.get_incomplete_sessions()?;
    if sessions.is_empty() {
        println!("No incomplete sessions");
        return Ok(());
    }

    println!("Incomplete sessions:");
    for session in sessions {
        println!(
            "  {}  status={}  chunks={}/{}",
            session.id,
            session.status.as_str(),
            session.uploaded_chunks,
            session.total_chunks
        );
    }
    println!("Resume upload with: sync <session_id> <user_id>");
    Ok(())
}

fn build_pipeline(config: &AppConfig) -> Result<Arc<Pipeline>, Box<dyn std::error::Error>> {
    let remote = config
        .remote
        .as_ref()
        .ok_or("[remote] section is required for processing")?;
    let objects: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
        &remote.base_url,
        remote.auth_token.clone(),
    )?);

    let openai = Arc::new(OpenAiClient::from_config(&config.openai)?);
    let stt: Arc<dyn SpeechToText> = openai.clone();
    let chat: Arc<dyn ChatModel> = openai;

    let lectures: Arc<dyn LectureStore> = match &config.lectures {
        Some(lectures) => Arc::new(HttpLectureStore::new(
            &lectures.base_url,
            lectures.auth_token.clone(),
        )?),
        None => {
            println!("No [lectures] configured, results are kept in memory only");
            Arc::new(MemoryLectureStore::new())
        }
    };

    Ok(Arc::new(Pipeline::new(objects, stt, chat, lectures)))
}

fn run_process(
    config_path: &PathBuf,
    session_id: &str,
    user_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(config_path)?;
    let pipeline = build_pipeline(&config)?;

    let result = pipeline.process(session_id, user_id)?;
    println!("✓ Processing complete for session {}", result.session_id);
    println!("  chunks:     {}", result.total_chunks);
    println!("  duration:   {:.1}s", result.duration_secs);
    println!("  transcript: {} chars", result.transcript_clean.len());
    println!("  notes:      {} chars", result.notes.len());
    Ok(())
}

fn run_serve(
    config_path: &PathBuf,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(config_path)?;
    let pipeline = build_pipeline(&config)?;
    server::serve(pipeline, port.unwrap_or(config.server.port))
}
