use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use jiff::Zoned;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tsquery::conf::{OutputFormat, Settings, config_path};
use tsquery::query::{FtInitDownload, FtInitUpload, NotifyRegister, UseServer};
use tsquery::{Command, Connection, Event, EventClass, FileTransfer, QueryClient, QueryResponse};

#[derive(Parser)]
#[command(name = "tsquery")]
#[command(about = "TeamSpeak 3 ServerQuery client")]
#[command(version = "0.1.0")]
struct Cli {
    /// Server host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// ServerQuery port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Query login name
    #[arg(long, short = 'u', global = true)]
    user: Option<String>,

    /// Query login password
    #[arg(long, global = true)]
    password: Option<String>,

    /// Virtual server to select after login
    #[arg(long, global = true)]
    server_id: Option<u32>,

    /// Output format: text or json
    #[arg(long, global = true)]
    format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single command, e.g. `exec clientlist -uid` or `exec use sid=1`
    Exec {
        name: String,

        /// `key=value` arguments and `-flag` options; a repeated key sends one block per value
        #[arg(allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Register for events and print notifications until interrupted
    Listen {
        /// Event classes to register for
        #[arg(long = "event", default_values_t = vec!["server".to_string(), "textprivate".to_string()])]
        events: Vec<String>,

        /// Channel to watch for `channel` events (0 = all channels)
        #[arg(long, default_value = "0")]
        channel_id: u32,
    },

    /// Upload a local file into a channel's file area
    Upload {
        file: PathBuf,

        /// Remote path, e.g. /notes.txt
        remote: String,

        #[arg(long, default_value = "0")]
        cid: u32,

        /// Channel password
        #[arg(long)]
        cpw: Option<String>,

        #[arg(long)]
        overwrite: bool,
    },

    /// Download a file from a channel's file area
    Download {
        /// Remote path, e.g. /notes.txt
        remote: String,

        file: PathBuf,

        #[arg(long, default_value = "0")]
        cid: u32,

        /// Channel password
        #[arg(long)]
        cpw: Option<String>,
    },

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::load();
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.query_port = port;
        }
        if let Some(user) = &self.user {
            settings.username = Some(user.clone());
        }
        if let Some(password) = &self.password {
            settings.password = Some(password.clone());
        }
        if let Some(server_id) = self.server_id {
            settings.server_id = Some(server_id);
        }
        if let Some(format) = self.format {
            settings.output_format = format;
        }
        settings
    }
}

/// Connect, log in and select the configured virtual server
async fn open_session(settings: &Settings) -> Result<QueryClient> {
    let connection = Connection::connect(
        &settings.host,
        settings.query_port,
        settings.transport_config(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}:{}", settings.host, settings.query_port))?;
    let client = QueryClient::new(connection);

    if let Some(username) = &settings.username {
        let password = settings.password.as_deref().unwrap_or_default();
        client.login(username, password).await.context("Login failed")?;
    }

    if let Some(sid) = settings.server_id {
        client
            .use_server(UseServer {
                sid: Some(sid),
                nickname: settings.nickname.clone(),
                ..UseServer::default()
            })
            .await
            .with_context(|| format!("Failed to select virtual server {}", sid))?;
    }

    Ok(client)
}

/// Build a command from CLI words; repeated keys become one block per value
fn parse_command(name: &str, params: &[String]) -> Command {
    let mut command = Command::new(name);
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();

    for param in params {
        if let Some(option) = param.strip_prefix('-') {
            command = command.flag(option);
            continue;
        }
        let (key, value) = param.split_once('=').unwrap_or((param.as_str(), ""));
        match grouped.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value.to_string()),
            None => grouped.push((key.to_string(), vec![value.to_string()])),
        }
    }

    for (key, mut values) in grouped {
        command = if values.len() == 1 {
            command.arg(key, values.remove(0))
        } else {
            command.arg(key, values)
        };
    }
    command
}

fn print_response(response: &QueryResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for row in &response.rows {
                let fields: Vec<String> = row.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                println!("{}", fields.join(" "));
            }
            eprintln!("{}", response.status);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
    }
    Ok(())
}

fn format_event(event: &Event, format: OutputFormat) -> Result<String> {
    let now = Zoned::now();
    let mut value = serde_json::to_value(event)?;

    match format {
        OutputFormat::Json => {
            if let Some(fields) = value.as_object_mut() {
                fields.insert("timestamp".to_string(), now.to_string().into());
            }
            Ok(serde_json::to_string(&value)?)
        }
        OutputFormat::Text => {
            let fields = value
                .as_object()
                .map(|fields| {
                    fields
                        .iter()
                        .filter(|(k, _)| k.as_str() != "event" && k.as_str() != "properties")
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            Ok(format!(
                "[{}] {} {}",
                now.strftime("%H:%M:%S"),
                event.kind().wire_name(),
                fields
            ))
        }
    }
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .progress_chars("#>-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    }
}

fn file_transfer(settings: &Settings) -> FileTransfer {
    FileTransfer::new(settings.host.clone(), settings.transfer_port)
        .with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
}

async fn exec(settings: &Settings, name: &str, params: &[String]) -> Result<()> {
    let client = open_session(settings).await?;
    let result = client.raw(parse_command(name, params)).await;
    client.quit().await;

    let response = result.with_context(|| format!("`{}` failed", name))?;
    print_response(&response, settings.output_format)
}

async fn listen(settings: &Settings, events: &[String], channel_id: u32) -> Result<()> {
    let classes = events
        .iter()
        .map(|name| name.parse::<EventClass>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    let client = open_session(settings).await?;
    let format = settings.output_format;

    for class in &classes {
        // Subscribe before registering so no early notification is dropped
        client.subscribe_class(*class, move |event: &Event| {
            println!("{}", format_event(event, format)?);
            Ok(())
        });
        let channel_id = (*class == EventClass::Channel).then_some(channel_id);
        client
            .register_events(NotifyRegister {
                event: *class,
                channel_id,
            })
            .await
            .with_context(|| format!("Failed to register for {} events", class.as_str()))?;
    }
    eprintln!("Listening for events, press Ctrl+C to stop");

    tokio::select! {
        reason = client.connection().closed() => match reason.error {
            Some(e) => bail!("Connection lost: {}", e),
            None => Ok(()),
        },
        _ = tokio::signal::ctrl_c() => {
            client.quit().await;
            Ok(())
        }
    }
}

async fn upload(settings: &Settings, file: PathBuf, remote: String, cid: u32, cpw: Option<String>, overwrite: bool) -> Result<()> {
    let source = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let size = source.metadata().await?.len();

    let client = open_session(settings).await?;
    let session = client
        .ft_init_upload(FtInitUpload {
            client_transfer_id: 1,
            name: remote.clone(),
            channel_id: cid,
            channel_password: cpw,
            size,
            overwrite,
            resume: false,
        })
        .await
        .with_context(|| format!("Server refused upload of {}", remote))?;

    let pb = progress_bar(Some(size));
    let result = file_transfer(settings)
        .upload_from(session, pb.wrap_async_read(source))
        .await;
    client.quit().await;

    let sent = result.context("Upload failed")?;
    pb.finish_with_message("Upload complete!");
    eprintln!("Uploaded {} bytes to {}", sent, remote);
    Ok(())
}

async fn download(settings: &Settings, remote: String, file: PathBuf, cid: u32, cpw: Option<String>) -> Result<()> {
    let client = open_session(settings).await?;
    let session = client
        .ft_init_download(FtInitDownload {
            client_transfer_id: 1,
            name: remote.clone(),
            channel_id: cid,
            channel_password: cpw,
            seek_position: 0,
        })
        .await
        .with_context(|| format!("Server refused download of {}", remote))?;

    let target = tokio::fs::File::create(&file)
        .await
        .with_context(|| format!("Failed to create {}", file.display()))?;
    let pb = progress_bar(session.size);
    let result = file_transfer(settings)
        .download_to(session, pb.wrap_async_write(target))
        .await;
    client.quit().await;

    let received = result.context("Download failed")?;
    pb.finish_with_message("Download complete!");
    eprintln!("Saved {} bytes to {}", received, file.display());
    Ok(())
}

fn config(settings: &Settings, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut shown = settings.clone();
            if shown.password.is_some() {
                shown.password = Some("********".to_string());
            }
            match settings.output_format {
                OutputFormat::Text => print!("{}", toml::to_string_pretty(&shown)?),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
            }
        }
        ConfigAction::Path => match config_path() {
            Some(path) => println!("{}", path.display()),
            None => bail!("Could not determine config directory"),
        },
        ConfigAction::Init { force } => {
            let path = config_path().context("Could not determine config directory")?;
            if path.exists() && !force {
                bail!("{} already exists (use --force to replace it)", path.display());
            }
            Settings::default().save_to(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let settings = cli.settings();

    let result = match cli.command {
        Commands::Exec { name, params } => exec(&settings, &name, &params).await,
        Commands::Listen { events, channel_id } => listen(&settings, &events, channel_id).await,
        Commands::Upload {
            file,
            remote,
            cid,
            cpw,
            overwrite,
        } => upload(&settings, file, remote, cid, cpw, overwrite).await,
        Commands::Download {
            remote,
            file,
            cid,
            cpw,
        } => download(&settings, remote, file, cid, cpw).await,
        Commands::Config { action } => config(&settings, action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
