//! CLI entry point for the relay messenger.
//!
//! Supports identity management, configuration files, offline code
//! utilities and an interactive line-oriented chat client.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use zk_relay_messenger::{
    app::{AppCommand, AppEvent, AppHandle},
    crypto::{codec, IdentityStore, PasscodeHashes},
    session::SessionEvent,
    utils::{FileStore, KeyValueStore, MessengerConfig, DEFAULT_CONFIG_FILE},
    App,
};

/// Zero-knowledge relay messenger - anonymous end-to-end encrypted sessions
#[derive(Parser)]
#[command(name = "zkchat")]
#[command(about = "Anonymous end-to-end encrypted chat sessions over an untrusted relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for the identity and session records
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or reset the device identity
    Identity {
        #[command(subcommand)]
        action: IdentityCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Offline helpers for session codes
    Code {
        #[command(subcommand)]
        action: CodeCommands,
    },
    /// Connect to the relay and chat interactively
    Run {
        /// Relay URL, overriding the configuration
        #[arg(short, long)]
        relay: Option<String>,
        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,
        /// Create a new session on start
        #[arg(long, conflicts_with = "join")]
        create: bool,
        /// Join a session on start (SESSIONID-PASSCODE)
        #[arg(short, long)]
        join: Option<String>,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Display the friend code and public key
    Show {
        /// Output format (pretty, json)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Destroy the identity and every stored session
    Reset {
        /// Confirm the reset
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[derive(Subcommand)]
enum CodeCommands {
    /// Generate a fresh join code
    New,
    /// Print both passcode hash generations
    Hash {
        /// Plaintext passcode
        passcode: String,
    },
    /// Check and normalize a join code
    Parse {
        /// Join code such as ABC123-WXYZ
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = MessengerConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Identity { action } => handle_identity_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Code { action } => handle_code_commands(action),
        Commands::Run {
            relay,
            name,
            create,
            join,
        } => handle_run_command(config, relay, name, create, join).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn open_store(config: &MessengerConfig) -> Result<Arc<dyn KeyValueStore>> {
    config.ensure_directories()?;
    Ok(Arc::new(FileStore::open(&config.storage.data_dir)?))
}

fn handle_identity_commands(action: IdentityCommands, config: &MessengerConfig) -> Result<()> {
    let identities = IdentityStore::new(open_store(config)?);
    match action {
        IdentityCommands::Show { format } => {
            let identity = identities.load_or_create()?;
            let public_key = identity.keypair.public_key_base64();
            match format.as_str() {
                "json" => {
                    let shown = serde_json::json!({
                        "friend_code": identity.friend_code(),
                        "public_key": public_key,
                        "data_dir": config.storage.data_dir,
                    });
                    println!("{}", serde_json::to_string_pretty(&shown)?);
                }
                "pretty" => {
                    println!("Identity");
                    println!("========");
                    println!("Friend code: {}", identity.friend_code());
                    println!("Public key:  {public_key}");
                    println!("Stored in:   {}", config.storage.data_dir.display());
                }
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
        IdentityCommands::Reset { force } => {
            if !force {
                return Err(anyhow::anyhow!(
                    "This destroys the identity and all sessions. Use --force to confirm."
                ));
            }
            identities.reset()?;
            println!("✓ Identity and sessions removed");
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => MessengerConfig::from_file(path)?,
                None => config.clone(),
            };
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => match section {
            Some(name) => {
                let table = toml::Value::try_from(config)?;
                let section = table
                    .get(&name)
                    .ok_or_else(|| anyhow::anyhow!("No such section: {}", name))?;
                println!("[{name}]");
                println!("{}", toml::to_string_pretty(section)?);
            }
            None => println!("{}", config.to_toml_string()?),
        },
    }
    Ok(())
}

fn handle_code_commands(action: CodeCommands) -> Result<()> {
    match action {
        CodeCommands::New => {
            println!("{}-{}", codec::generate_session_id(), codec::generate_passcode());
        }
        CodeCommands::Hash { passcode } => {
            let hashes = PasscodeHashes::from_passcode(&passcode);
            println!("current: {}", hashes.current);
            println!("legacy:  {}", hashes.legacy.unwrap_or_default());
        }
        CodeCommands::Parse { code } => {
            let code = codec::parse_join_code(&code)?;
            println!("session:  {}", code.session_id);
            println!("passcode: {}", code.passcode);
            println!("code:     {code}");
        }
    }
    Ok(())
}

async fn handle_run_command(
    mut config: MessengerConfig,
    relay: Option<String>,
    name: Option<String>,
    create: bool,
    join: Option<String>,
) -> Result<()> {
    // Override config with command line options
    if let Some(relay) = relay {
        config.relay.url = relay;
    }
    if let Some(name) = name {
        config.session.display_name = name;
    }
    config.validate()?;

    info!("Relay: {}", config.relay.url);
    let (app, handle, mut events) = App::open(config)?;
    println!("Your friend code is {}. Type /help for commands.", app.identity().friend_code());
    let app_task = tokio::spawn(app.run());

    if create {
        handle.send(AppCommand::CreateSession)?;
    }
    if let Some(code) = join {
        handle.send(AppCommand::Join { code })?;
    }

    let mut console = Console::new(handle.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !console.handle_line(&line)? {
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(AppEvent::Stopped) | None => break,
                Some(event) => console.show(event),
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.shutdown();
    app_task.await??;
    Ok(())
}

/// Line-oriented front end state
struct Console {
    handle: AppHandle,
    current: Option<String>,
    last_invite: Option<(String, Option<PasscodeHashes>)>,
}

impl Console {
    fn new(handle: AppHandle) -> Self {
        Self {
            handle,
            current: None,
            last_invite: None,
        }
    }

    /// Returns false when the user asked to quit
    fn handle_line(&mut self, line: &str) -> Result<bool> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(true);
        }
        let Some(command) = line.strip_prefix('/') else {
            return self.send_text(line).map(|()| true);
        };

        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        let arg = arg.trim();
        let command = match verb {
            "quit" | "exit" => return Ok(false),
            "help" => {
                print_help();
                return Ok(true);
            }
            "new" => AppCommand::CreateSession,
            "join" if !arg.is_empty() => AppCommand::Join {
                code: arg.to_string(),
            },
            "accept" => match self.last_invite.take() {
                Some((session_id, Some(hashes))) => AppCommand::AcceptInvite { session_id, hashes },
                Some((session_id, None)) => {
                    println!("! invitation to {session_id} carried no passcode; ask for the code");
                    return Ok(true);
                }
                None => {
                    println!("! no pending invitation");
                    return Ok(true);
                }
            },
            "use" if !arg.is_empty() => {
                self.current = Some(arg.to_ascii_uppercase());
                println!("* now talking in {}", arg.to_ascii_uppercase());
                return Ok(true);
            }
            "leave" => match self.target(arg) {
                Some(session_id) => AppCommand::Leave { session_id },
                None => return Ok(true),
            },
            "forget" => match self.target(arg) {
                Some(session_id) => AppCommand::Forget { session_id },
                None => return Ok(true),
            },
            "invite" if !arg.is_empty() => match self.target("") {
                Some(session_id) => AppCommand::Invite {
                    session_id,
                    friend_code: arg.to_string(),
                },
                None => return Ok(true),
            },
            "name" if !arg.is_empty() => AppCommand::SetDisplayName {
                name: arg.to_string(),
            },
            "typing" => match self.target("") {
                Some(session_id) => AppCommand::Typing {
                    session_id,
                    typing: arg != "off",
                },
                None => return Ok(true),
            },
            "sessions" => AppCommand::ListSessions,
            "reconnect" => AppCommand::Reconnect,
            _ => {
                println!("! unknown command, try /help");
                return Ok(true);
            }
        };
        self.handle.send(command)?;
        Ok(true)
    }

    fn send_text(&self, text: &str) -> Result<()> {
        match &self.current {
            Some(session_id) => self.handle.send(AppCommand::Send {
                session_id: session_id.clone(),
                text: text.to_string(),
            })?,
            None => println!("! no active session; /new or /join first"),
        }
        Ok(())
    }

    fn target(&self, arg: &str) -> Option<String> {
        if !arg.is_empty() {
            return Some(arg.to_ascii_uppercase());
        }
        if self.current.is_none() {
            println!("! no active session");
        }
        self.current.clone()
    }

    fn show(&mut self, event: AppEvent) {
        match event {
            AppEvent::Connection(state) => println!("* relay {state}"),
            AppEvent::SessionCodeIssued { code } => {
                println!("* session created, share this code: {code}");
                self.current = Some(code.session_id);
            }
            AppEvent::Session(event) => self.show_session_event(event),
            AppEvent::RateLimited {
                action,
                retry_after,
            } => println!("! slow down, {action} allowed again in {:.1}s", retry_after.as_secs_f64()),
            AppEvent::Sessions(list) if list.is_empty() => println!("* no sessions"),
            AppEvent::Sessions(list) => {
                for summary in list {
                    let marker = if self.current.as_ref() == Some(&summary.session_id) { ">" } else { " " };
                    println!(
                        "{marker} {} [{}] {} {}",
                        summary.join_code.as_deref().unwrap_or(&summary.session_id),
                        summary.phase,
                        summary.participants.join(", "),
                        summary.fingerprint.unwrap_or_default(),
                    );
                }
            }
            AppEvent::Error { error } => println!("! {error}"),
            AppEvent::Stopped => {}
        }
    }

    fn show_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SessionCreated { session_id } | SessionEvent::SessionJoined { session_id } => {
                println!("* in session {session_id}, waiting for a peer");
                self.current = Some(session_id);
            }
            SessionEvent::JoinFailed { error, .. } => println!("! {error}"),
            SessionEvent::SessionLeft { session_id } => println!("* left {session_id}"),
            SessionEvent::ParticipantJoined { session_id, .. } => {
                println!("* someone joined {session_id}");
            }
            SessionEvent::ParticipantRejoined { session_id, .. } => {
                println!("* peer reconnected to {session_id}, renegotiating keys");
            }
            SessionEvent::ParticipantLeft { session_id, .. } => println!("* peer left {session_id}"),
            SessionEvent::CryptoReady {
                session_id,
                fingerprint,
                ..
            } => println!("* secure channel in {session_id}, fingerprint {fingerprint}"),
            SessionEvent::PeerNamed { display_name, .. } => println!("* peer is {display_name}"),
            SessionEvent::MessageReceived {
                session_id,
                sender,
                text,
                ..
            } => println!("[{session_id}] {sender}: {text}"),
            SessionEvent::TypingChanged { typing: true, .. } => println!("* typing..."),
            SessionEvent::TypingChanged { typing: false, .. } => {}
            SessionEvent::SessionExpired { session_id } => println!("* session {session_id} expired"),
            SessionEvent::InviteReceived { session_id, hashes } => {
                println!("* invitation to session {session_id}, /accept to join");
                self.last_invite = Some((session_id, hashes));
            }
            SessionEvent::PingRateLimited { retry_after, reason } => {
                let wait = retry_after.map_or(String::new(), |d| format!(" ({:.0}s)", d.as_secs_f64()));
                println!("! relay refused the invite{wait}: {}", reason.unwrap_or_default());
            }
            SessionEvent::RelayError { message } => println!("! relay: {message}"),
        }
    }
}

fn print_help() {
    println!("/new                 create a session");
    println!("/join CODE           join with SESSIONID-PASSCODE");
    println!("/accept              accept the last invitation");
    println!("/use ID              switch the active session");
    println!("/invite FRIEND-CODE  invite a friend into the active session");
    println!("/leave [ID]          leave, keeping the seat token");
    println!("/forget [ID]         leave and forget the session");
    println!("/name NAME           change your display name");
    println!("/typing [off]        show or clear your typing indicator");
    println!("/sessions            list sessions");
    println!("/reconnect           reconnect after giving up");
    println!("/quit                exit");
}
