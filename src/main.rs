use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use meeting_recorder::config::{Config, CONFIG_FILE_NAME};
use meeting_recorder::convert::{Convert, FfmpegConverter};
use meeting_recorder::delete::ForcedDeleter;
use meeting_recorder::effects::RecorderEffectRunner;
use meeting_recorder::orchestrator::Orchestrator;
use meeting_recorder::sender::{BatchSender, SendOptions};
use meeting_recorder::state_machine::StatusUpdate;
use meeting_recorder::upload::WebhookUploader;

#[derive(Parser)]
#[command(name = "meeting-recorder")]
#[command(about = "Record meeting audio and deliver it to a webhook", long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until Ctrl-C, then convert/upload/delete (default)
    Record,
    /// Send every audio file left in the watch folder to the webhook
    Send {
        /// Folder to scan (default: watch_folder from config)
        #[arg(short, long)]
        folder: Option<PathBuf>,
        /// Search subdirectories recursively
        #[arg(short, long)]
        recursive: bool,
        /// Delete files after successful upload
        #[arg(short, long)]
        delete: bool,
        /// Seconds to wait between uploads
        #[arg(long, default_value = "0")]
        delay: u64,
    },
    /// Force-delete every WAV left in the watch folder
    Cleanup {
        /// Folder to clean (default: watch_folder from config)
        #[arg(short, long)]
        folder: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present; production uses real env vars
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);

    match cli.command.unwrap_or(Commands::Record) {
        Commands::Record => record(config).await,
        Commands::Send {
            folder,
            recursive,
            delete,
            delay,
        } => {
            send(
                config,
                folder,
                SendOptions {
                    recursive,
                    delete_after_upload: delete,
                    delay_between_uploads: Duration::from_secs(delay),
                },
            )
            .await
        }
        Commands::Cleanup { folder } => cleanup(config, folder).await,
    }
}

async fn record(config: Config) -> ExitCode {
    let webhook_url = match config.require_webhook_url() {
        Ok(url) => url.to_string(),
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let converter: Option<Arc<dyn Convert>> = if config.convert_to_mp3 {
        Some(Arc::new(FfmpegConverter::new(config.mp3_bitrate.clone())))
    } else {
        None
    };
    let uploader = Arc::new(WebhookUploader::new(
        webhook_url,
        config.credentials.clone(),
    ));
    let deleter = Arc::new(ForcedDeleter::new());

    let runner = RecorderEffectRunner::new(
        config.watch_folder.clone(),
        converter,
        uploader,
        deleter,
    );
    let (orchestrator, mut status_rx, loop_handle) = Orchestrator::spawn(runner);

    orchestrator.start().await;
    log::info!("Press Ctrl-C to stop recording");

    let mut stopping = false;
    let mut exit = ExitCode::SUCCESS;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("Cannot listen for Ctrl-C: {}", e);
                    orchestrator.shutdown().await;
                    break;
                }
                if stopping {
                    // Second Ctrl-C: stop waiting for the pipeline.
                    log::warn!("Interrupted again, exiting without waiting for delivery");
                    orchestrator.shutdown().await;
                    exit = ExitCode::FAILURE;
                    break;
                }
                stopping = true;
                orchestrator.stop().await;
            }
            status = status_rx.recv() => {
                let Some(update) = status else {
                    break;
                };
                report(&update);
                match update {
                    StatusUpdate::Ready { .. } | StatusUpdate::DiscardedTooSmall { .. } => {
                        orchestrator.shutdown().await;
                        break;
                    }
                    StatusUpdate::Failed { .. } => {
                        orchestrator.shutdown().await;
                        exit = ExitCode::FAILURE;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Err(e) = loop_handle.await {
        log::error!("Event loop task failed: {}", e);
        return ExitCode::FAILURE;
    }
    exit
}

fn report(update: &StatusUpdate) {
    match update {
        StatusUpdate::Idle => {}
        StatusUpdate::Starting => println!("Starting capture..."),
        StatusUpdate::AlreadyRecording => println!("Already recording"),
        StatusUpdate::NotRecording => println!("Not recording"),
        StatusUpdate::Recording { file } => println!("Recording to {}", file.display()),
        StatusUpdate::Stopping => println!("Stopping capture..."),
        StatusUpdate::DiscardedTooSmall { file, size_bytes } => {
            println!(
                "Discarded {} ({} bytes, too small to be a recording)",
                file.display(),
                size_bytes
            );
        }
        StatusUpdate::Converting { file } => println!("Converting {}", file.display()),
        StatusUpdate::Uploading { file } => println!("Uploading {}", file.display()),
        StatusUpdate::Deleting { file } => println!("Deleting {}", file.display()),
        StatusUpdate::Ready { file } => println!("Delivered {}", file.display()),
        StatusUpdate::Failed { message } => println!("Failed: {}", message),
    }
}

async fn send(config: Config, folder: Option<PathBuf>, options: SendOptions) -> ExitCode {
    let webhook_url = match config.require_webhook_url() {
        Ok(url) => url.to_string(),
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let folder = folder.unwrap_or_else(|| config.watch_folder.clone());
    let uploader = Arc::new(WebhookUploader::new(
        webhook_url,
        config.credentials.clone(),
    ));
    let sender = match BatchSender::new(folder, uploader, Arc::new(ForcedDeleter::new())) {
        Ok(sender) => sender,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = sender.send_all(options).await;
    println!(
        "Sent {} of {} file(s), {} failed",
        report.successful, report.total, report.failed
    );
    if report.all_successful() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn cleanup(config: Config, folder: Option<PathBuf>) -> ExitCode {
    let folder = folder.unwrap_or_else(|| config.watch_folder.clone());
    let deleter = ForcedDeleter::new();
    let (deleted, failed) = deleter.cleanup_folder(&folder).await;
    println!("Deleted {} file(s), {} failed", deleted, failed);
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
