use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use clap::Parser;
use lifelink_client::{
    ClipboardBridge, ComposerInput, FileSource, FileTransferManager, FileTransferState,
    MessageComposer, MessageStream, RelayBackend, SeenMessages, SubmitOutcome, SystemClipboard,
    TransferError, TransferOutcome, TransferPhase,
    config::{
        ClientConfig, DEFAULT_SERVER_URL, config_path, data_dir, load_config_from_path,
        save_config_with_retry, validate_config,
    },
    logging::init_logging,
};
use lifelink_core::{
    DeviceTag, Identity, Message, classify_device,
    format::{format_file_size, format_sent_at},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "lifelink")]
struct ClientArgs {
    /// Relay WebSocket endpoint. Saved for later runs.
    #[arg(long)]
    server_url: Option<String>,
    /// Signed-in user id. Required on first run.
    #[arg(long)]
    uid: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    avatar_url: Option<String>,
    /// Device description used to pick the origin tag, e.g. a user agent.
    #[arg(long)]
    device_signature: Option<String>,
}

impl ClientArgs {
    fn overrides_saved(&self) -> bool {
        self.server_url.is_some()
            || self.uid.is_some()
            || self.display_name.is_some()
            || self.email.is_some()
            || self.avatar_url.is_some()
            || self.device_signature.is_some()
    }
}

#[tokio::main]
async fn main() {
    init_logging(&data_dir());

    let args = ClientArgs::parse();
    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let signature = config
        .device_signature
        .clone()
        .unwrap_or_else(|| format!("lifelink-terminal ({})", std::env::consts::OS));
    let device = classify_device(&signature);
    info!(server_url = %config.server_url, uid = %config.identity.uid, %device, "client starting");

    let backend = match RelayBackend::connect(&config.server_url).await {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            error!("could not connect: {}", err);
            eprintln!("could not connect to {}: {err}", config.server_url);
            std::process::exit(1);
        }
    };
    println!(
        "connected to {} as {} {}",
        config.server_url,
        display_name(&config.identity),
        device
    );
    println!("type a message and press enter; /upload <path>, /copy [n], /quit");

    run_session(backend, config.identity, device).await;
    info!("client exiting");
}

fn resolve_config(args: &ClientArgs) -> Result<ClientConfig, String> {
    let path = config_path();
    let saved = match load_config_from_path(&path) {
        Ok(saved) => saved,
        Err(err) => {
            warn!(path = %path.display(), "ignoring saved config: {}", err);
            None
        }
    };

    let mut config = match (saved, &args.uid) {
        (Some(saved), _) => saved,
        (None, Some(uid)) => ClientConfig {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            identity: Identity {
                uid: uid.clone(),
                display_name: None,
                email: None,
                avatar_url: None,
            },
            device_signature: None,
        },
        (None, None) => {
            return Err(format!(
                "no saved config at {}; pass --uid (and optionally --server-url)",
                path.display()
            ));
        }
    };

    if let Some(server_url) = &args.server_url {
        config.server_url = server_url.clone();
    }
    if let Some(uid) = &args.uid {
        config.identity.uid = uid.clone();
    }
    if let Some(name) = &args.display_name {
        config.identity.display_name = Some(name.clone());
    }
    if let Some(email) = &args.email {
        config.identity.email = Some(email.clone());
    }
    if let Some(avatar_url) = &args.avatar_url {
        config.identity.avatar_url = Some(avatar_url.clone());
    }
    if let Some(signature) = &args.device_signature {
        config.device_signature = Some(signature.clone());
    }

    validate_config(&config).map_err(|err| err.to_string())?;
    if args.overrides_saved() {
        if let Err(err) = save_config_with_retry(&path, &config) {
            warn!(path = %path.display(), "failed to save config: {}", err);
        }
    }
    Ok(config)
}

async fn run_session(backend: Arc<RelayBackend>, identity: Identity, device: DeviceTag) {
    let window: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let stream = MessageStream::new(backend.clone());
    let subscription = {
        let window = window.clone();
        let own_uid = identity.uid.clone();
        let mut printed = SeenMessages::new();
        stream.subscribe(move |messages| {
            for message in printed.fresh(&messages) {
                println!("{}", render_message(message, &own_uid));
            }
            *window.lock().unwrap_or_else(PoisonError::into_inner) = messages;
        })
    };

    let composer = MessageComposer::new(backend.clone());
    let transfers = FileTransferManager::new(backend.clone(), backend.clone());
    let clipboard = ClipboardBridge::new(SystemClipboard);
    let input = ComposerInput::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("stdin read failed: {}", err);
                break;
            }
        };
        if !backend.is_connected() {
            eprintln!("connection to relay lost");
            break;
        }
        if !subscription.is_active() {
            eprintln!("message feed stopped");
            break;
        }

        let command = line.trim();
        if command == "/quit" {
            break;
        }
        if let Some(path) = command.strip_prefix("/upload ") {
            start_upload(&transfers, Path::new(path.trim()), &identity, device).await;
            continue;
        }
        if command == "/copy" || command.starts_with("/copy ") {
            let nth = command["/copy".len()..].trim().parse::<usize>().unwrap_or(1);
            let target = {
                let window = window.lock().unwrap_or_else(PoisonError::into_inner);
                window
                    .iter()
                    .rev()
                    .filter(|m| m.body.is_some())
                    .nth(nth.saturating_sub(1))
                    .map(|m| (m.id.clone(), m.body.clone().unwrap_or_default()))
            };
            match target {
                Some((id, body)) => {
                    clipboard.copy(&body, &id).await;
                    if clipboard.is_just_copied(&id) {
                        println!("copied");
                    }
                }
                None => eprintln!("no message to copy"),
            }
            continue;
        }

        input.set(line);
        if let SubmitOutcome::RolledBack(err) = composer.submit(&input, &identity, device).await {
            eprintln!("not sent ({err}); text kept: {}", input.text());
        }
    }

    subscription.unsubscribe();
}

async fn start_upload(
    transfers: &FileTransferManager<RelayBackend, RelayBackend>,
    path: &Path,
    identity: &Identity,
    device: DeviceTag,
) {
    let file = match FileSource::from_path(path).await {
        Ok(file) => file,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };

    let mut last_decile = None;
    let task = transfers.upload(file, identity, device, move |state: Option<FileTransferState>| {
        let Some(state) = state else {
            return;
        };
        match state.phase {
            TransferPhase::Uploading => {
                let decile = (state.progress * 10.0).floor() as u8;
                if last_decile != Some(decile) {
                    last_decile = Some(decile);
                    println!(
                        "uploading {} ({}): {:.0}%",
                        state.file_name,
                        format_file_size(state.file_size_bytes),
                        state.progress * 100.0
                    );
                }
            }
            TransferPhase::Completed => println!("uploaded {}", state.file_name),
            TransferPhase::Failed => eprintln!(
                "upload of {} failed: {}",
                state.file_name,
                state.error.unwrap_or_default()
            ),
        }
    });

    match task {
        Ok(task) => {
            tokio::spawn(async move {
                if let TransferOutcome::Completed {
                    deletion: Some(deletion),
                    ..
                } = task.wait().await
                {
                    println!("large file, available until {}", format_sent_at(Some(deletion.due_at_ms)));
                }
            });
        }
        Err(TransferError::EmptyFile) => eprintln!("{} is empty, nothing to send", path.display()),
        Err(err) => eprintln!("{err}"),
    }
}

fn display_name(identity: &Identity) -> &str {
    identity
        .display_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(lifelink_core::ANONYMOUS_DISPLAY_NAME)
}

fn render_message(message: &Message, own_uid: &str) -> String {
    let who = if message.sender_id == own_uid {
        "you"
    } else {
        message.sender_display_name.as_str()
    };
    let when = format_sent_at(message.sent_at);
    let tag = message.origin_device_tag;
    match (&message.attachment, &message.body) {
        (Some(file), _) => format!(
            "[{when}] {who} {tag} sent {} ({}) {}",
            file.file_name,
            format_file_size(file.file_size_bytes),
            file.url
        ),
        (None, Some(body)) => format!("[{when}] {who} {tag}: {body}"),
        (None, None) => format!("[{when}] {who} {tag}"),
    }
}
