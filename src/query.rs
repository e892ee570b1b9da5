//! Typed command facade
//!
//! A thin layer over `Connection`: each method builds one command from a
//! parameter struct, executes it and picks the interesting fields out of the
//! result rows. Unset optional fields never reach the wire.

use serde::Serialize;
use thiserror::Error;

use crate::events::{Event, EventClass, EventKind};
use crate::protocol::{Command, FieldError, QueryResponse, Row, StatusLine};
use crate::transfer::TransferSession;
use crate::transport::{Connection, QueryError, SubscriptionId};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("unexpected reply to `{command}`: {source}")]
    Field {
        command: &'static str,
        #[source]
        source: FieldError,
    },
    #[error("`{0}` returned no rows")]
    NoRows(&'static str),
}

impl ClientError {
    /// Status line of a server-side command failure
    pub fn status(&self) -> Option<&StatusLine> {
        match self {
            ClientError::Query(e) => e.status(),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, ClientError>;

/// Selects the virtual server a session operates on
#[derive(Debug, Clone, Default)]
pub struct UseServer {
    pub sid: Option<u32>,
    pub port: Option<u16>,
    pub nickname: Option<String>,
    /// Start the server if it is stopped
    pub start_virtual: bool,
}

#[derive(Debug, Clone)]
pub struct NotifyRegister {
    pub event: EventClass,
    /// Channel to watch; only meaningful for `EventClass::Channel`
    pub channel_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTarget {
    Client(u32),
    Channel(u32),
    Server(u32),
}

impl TextTarget {
    fn mode(&self) -> u8 {
        match self {
            TextTarget::Client(_) => 1,
            TextTarget::Channel(_) => 2,
            TextTarget::Server(_) => 3,
        }
    }

    fn id(&self) -> u32 {
        match self {
            TextTarget::Client(id) | TextTarget::Channel(id) | TextTarget::Server(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendTextMessage {
    pub target: TextTarget,
    pub msg: String,
}

/// Permission by numeric id or by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Id(u32),
    Name(String),
}

#[derive(Debug, Clone)]
pub struct ServerGroupAddPerm {
    pub sgid: u32,
    pub permission: Permission,
    pub value: i32,
    pub skip: bool,
    pub negated: bool,
}

/// Extra columns requested from `clientlist`
#[derive(Debug, Clone, Default)]
pub struct ClientListOptions {
    pub uid: bool,
    pub away: bool,
    pub voice: bool,
    pub times: bool,
    pub groups: bool,
    pub info: bool,
    pub country: bool,
    pub ip: bool,
}

#[derive(Debug, Clone)]
pub struct FtInitUpload {
    pub client_transfer_id: u16,
    pub name: String,
    pub channel_id: u32,
    pub channel_password: Option<String>,
    pub size: u64,
    pub overwrite: bool,
    pub resume: bool,
}

#[derive(Debug, Clone)]
pub struct FtInitDownload {
    pub client_transfer_id: u16,
    pub name: String,
    pub channel_id: u32,
    pub channel_password: Option<String>,
    pub seek_position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub version: String,
    pub build: u64,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhoAmI {
    pub virtual_server_id: u32,
    pub client_id: u32,
    pub channel_id: u32,
    pub nickname: Option<String>,
    pub database_id: u64,
    pub login_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientEntry {
    pub clid: u32,
    pub cid: u32,
    pub database_id: u64,
    pub nickname: String,
    /// 0 for voice clients, 1 for query clients
    pub client_type: u8,
    /// Every column the server sent, including those requested via options
    pub properties: Row,
}

/// Client for one query session
#[derive(Debug, Clone)]
pub struct QueryClient {
    connection: Connection,
}

impl QueryClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Execute an arbitrary command
    pub async fn raw(&self, command: Command) -> Result<QueryResponse> {
        Ok(self.connection.submit(command).await?)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let command = Command::new("login")
            .arg("client_login_name", username)
            .arg("client_login_password", password);
        self.connection.execute(command).await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.connection.execute(Command::new("logout")).await?;
        Ok(())
    }

    pub async fn use_server(&self, params: UseServer) -> Result<()> {
        let command = Command::new("use")
            .arg_opt("sid", params.sid)
            .arg_opt("port", params.port)
            .arg_opt("client_nickname", params.nickname)
            .flag_if("virtual", params.start_virtual);
        self.connection.execute(command).await?;
        Ok(())
    }

    pub async fn version(&self) -> Result<Version> {
        let row = self.first_row("version", Command::new("version")).await?;
        field("version", || {
            Ok(Version {
                version: row.require("version")?,
                build: row.require("build")?,
                platform: row.require("platform")?,
            })
        })
    }

    pub async fn whoami(&self) -> Result<WhoAmI> {
        let row = self.first_row("whoami", Command::new("whoami")).await?;
        field("whoami", || {
            Ok(WhoAmI {
                virtual_server_id: row.require("virtualserver_id")?,
                client_id: row.require("client_id")?,
                channel_id: row.require("client_channel_id")?,
                nickname: optional_text(&row, "client_nickname"),
                database_id: row.require("client_database_id")?,
                login_name: optional_text(&row, "client_login_name"),
            })
        })
    }

    pub async fn register_events(&self, params: NotifyRegister) -> Result<()> {
        let command = Command::new("servernotifyregister")
            .arg("event", params.event.as_str())
            .arg_opt("id", params.channel_id);
        self.connection.execute(command).await?;
        Ok(())
    }

    /// Subscribe `handler` to every notification kind emitted for `class`
    pub fn subscribe_class<F>(&self, class: EventClass, handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Clone + Send + Sync + 'static,
    {
        class
            .kinds()
            .iter()
            .map(|kind| self.connection.subscribe(*kind, handler.clone()))
            .collect()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.connection.subscribe(kind, handler)
    }

    pub async fn send_text_message(&self, params: SendTextMessage) -> Result<()> {
        let command = Command::new("sendtextmessage")
            .arg("targetmode", params.target.mode())
            .arg("target", params.target.id())
            .arg("msg", params.msg);
        self.connection.execute(command).await?;
        Ok(())
    }

    pub async fn server_group_add_perm(&self, params: ServerGroupAddPerm) -> Result<()> {
        let command = Command::new("servergroupaddperm").arg("sgid", params.sgid);
        let command = match params.permission {
            Permission::Id(id) => command.arg("permid", id),
            Permission::Name(name) => command.arg("permsid", name),
        };
        let command = command
            .arg("permvalue", params.value)
            .arg("permskip", params.skip)
            .arg("permnegated", params.negated);
        self.connection.execute(command).await?;
        Ok(())
    }

    pub async fn client_list(&self, options: ClientListOptions) -> Result<Vec<ClientEntry>> {
        let command = Command::new("clientlist")
            .flag_if("uid", options.uid)
            .flag_if("away", options.away)
            .flag_if("voice", options.voice)
            .flag_if("times", options.times)
            .flag_if("groups", options.groups)
            .flag_if("info", options.info)
            .flag_if("country", options.country)
            .flag_if("ip", options.ip);
        let rows = match self.connection.execute(command).await {
            Ok(rows) => rows,
            Err(e) if e.status().is_some_and(StatusLine::is_empty_result) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        rows.into_iter()
            .map(|row| {
                field("clientlist", || {
                    Ok(ClientEntry {
                        clid: row.require("clid")?,
                        cid: row.require("cid")?,
                        database_id: row.require("client_database_id")?,
                        nickname: row.require("client_nickname")?,
                        client_type: row.parse("client_type")?.unwrap_or(0),
                        properties: row.clone(),
                    })
                })
            })
            .collect()
    }

    /// Mark an offline message as read or unread
    pub async fn message_update_flag(&self, msgid: u32, read: bool) -> Result<()> {
        let command = Command::new("messageupdateflag")
            .arg("msgid", msgid)
            .arg("flag", read);
        self.connection.execute(command).await?;
        Ok(())
    }

    /// Reserve an upload slot; the returned session feeds `FileTransfer::upload`
    pub async fn ft_init_upload(&self, params: FtInitUpload) -> Result<TransferSession> {
        let command = Command::new("ftinitupload")
            .arg("clientftfid", params.client_transfer_id)
            .arg("name", params.name)
            .arg("cid", params.channel_id)
            .arg("cpw", params.channel_password.unwrap_or_default())
            .arg("size", params.size)
            .arg("overwrite", params.overwrite)
            .arg("resume", params.resume);
        let row = self.first_row("ftinitupload", command).await?;
        transfer_session("ftinitupload", &row, Some(params.size))
    }

    /// Reserve a download slot; the size comes from the server's reply
    pub async fn ft_init_download(&self, params: FtInitDownload) -> Result<TransferSession> {
        let command = Command::new("ftinitdownload")
            .arg("clientftfid", params.client_transfer_id)
            .arg("name", params.name)
            .arg("cid", params.channel_id)
            .arg("cpw", params.channel_password.unwrap_or_default())
            .arg("seekpos", params.seek_position);
        let row = self.first_row("ftinitdownload", command).await?;
        let size = field("ftinitdownload", || row.parse("size"))?;
        transfer_session("ftinitdownload", &row, size)
    }

    /// Send `quit` and shut the connection down
    pub async fn quit(&self) {
        self.connection.close().await;
    }

    async fn first_row(&self, name: &'static str, command: Command) -> Result<Row> {
        self.connection
            .execute(command)
            .await?
            .into_iter()
            .next()
            .ok_or(ClientError::NoRows(name))
    }
}

fn field<T>(command: &'static str, f: impl FnOnce() -> std::result::Result<T, FieldError>) -> Result<T> {
    f().map_err(|source| ClientError::Field { command, source })
}

fn optional_text(row: &Row, key: &str) -> Option<String> {
    row.get(key).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Build a session from an `ftinit*` reply.
///
/// The server reports per-file failures inside the row rather than on the
/// status line.
fn transfer_session(command: &'static str, row: &Row, size: Option<u64>) -> Result<TransferSession> {
    let status: Option<u32> = field(command, || row.parse("status"))?;
    if let Some(id) = status
        && id != 0
    {
        let status = StatusLine {
            id,
            msg: row.get("msg").unwrap_or_default().to_string(),
            extra_msg: None,
            failed_permid: None,
        };
        return Err(QueryError::Command(status).into());
    }

    field(command, || {
        Ok(TransferSession {
            key: row.require("ftkey")?,
            size,
            port: row.parse("port")?,
        })
    })
}
