//! Wire protocol types for host ⇄ bridge communication.
//!
//! Every message is a [`Frame`]: a command code plus positional string fields.
//! Numbers travel as decimal text; a list travels as a count field followed by
//! that many items; a parameter block is a count followed by (name, value)
//! pairs.
//!
//! - **HostRequest**: frames the bridge accepts from the host
//! - **BridgeEvent**: frames the bridge emits (notifications, requests, replies)

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::Serialize;

use super::codec::Frame;

/// Member name the host writes to deliver an `eval` result.
pub const EVAL_RETURN_MEMBER: &str = "__lc_ret";

/// Command codes shared by both ends of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Command {
    CreateContext = 1,
    DestroyContext = 2,
    CreateProgram = 3,
    DestroyProgram = 4,
    StartProgram = 5,
    StopProgram = 6,
    InitProgram = 7,
    ShowDocument = 8,
    ShowDocumentInFrame = 9,
    ShowStatus = 10,
    ResizeProgram = 11,
    GetUrlData = 12,
    UrlData = 13,
    ShutdownServer = 14,
    ScriptEvent = 15,
    GetMember = 16,
    CallMember = 17,
    PutMember = 18,
    DerefObject = 19,
    AudioPlay = 20,
    AudioLoop = 21,
    AudioStop = 22,
    ProgramState = 23,
    ProgramFailed = 24,
    DataControl = 25,
    PutUrlData = 26,
    PutData = 27,
    SecurityConfirm = 28,
    ShowConsole = 29,
    ScriptGetMember = 30,
    ScriptCallMember = 31,
    ScriptReturn = 32,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let command = match code {
            1 => Self::CreateContext,
            2 => Self::DestroyContext,
            3 => Self::CreateProgram,
            4 => Self::DestroyProgram,
            5 => Self::StartProgram,
            6 => Self::StopProgram,
            7 => Self::InitProgram,
            8 => Self::ShowDocument,
            9 => Self::ShowDocumentInFrame,
            10 => Self::ShowStatus,
            11 => Self::ResizeProgram,
            12 => Self::GetUrlData,
            13 => Self::UrlData,
            14 => Self::ShutdownServer,
            15 => Self::ScriptEvent,
            16 => Self::GetMember,
            17 => Self::CallMember,
            18 => Self::PutMember,
            19 => Self::DerefObject,
            20 => Self::AudioPlay,
            21 => Self::AudioLoop,
            22 => Self::AudioStop,
            23 => Self::ProgramState,
            24 => Self::ProgramFailed,
            25 => Self::DataControl,
            26 => Self::PutUrlData,
            27 => Self::PutData,
            28 => Self::SecurityConfirm,
            29 => Self::ShowConsole,
            30 => Self::ScriptGetMember,
            31 => Self::ScriptCallMember,
            32 => Self::ScriptReturn,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command code {0}")]
    UnknownCommand(u8),

    #[error("{command:?} frame is missing field `{field}`")]
    MissingField {
        command: Command,
        field: &'static str,
    },

    #[error("{command:?} field `{field}` has invalid value {value:?}")]
    InvalidField {
        command: Command,
        field: &'static str,
        value: String,
    },

    #[error("{0:?} is not accepted from the host")]
    UnexpectedDirection(Command),
}

/// Handle for a guest object exposed to the script side.
///
/// Id 0 always denotes the hosted program itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const PROGRAM: ObjectId = ObjectId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_program(self) -> bool {
        self == Self::PROGRAM
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for a bridge-issued request awaiting a host reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Ticket(u64);

impl Ticket {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one tunneled I/O job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type tag of a value crossing the scripting bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Error,
    Void,
    Boolean,
    Function,
    Number,
    Object,
    String,
}

impl ValueKind {
    pub fn code(self) -> i32 {
        match self {
            Self::Error => -1,
            Self::Void => 0,
            Self::Boolean => 1,
            Self::Function => 2,
            Self::Number => 3,
            Self::Object => 4,
            Self::String => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Error,
            0 => Self::Void,
            1 => Self::Boolean,
            2 => Self::Function,
            3 => Self::Number,
            4 => Self::Object,
            5 => Self::String,
            _ => return None,
        })
    }
}

impl FromStr for ValueKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i32>()
            .ok()
            .and_then(Self::from_code)
            .ok_or(())
    }
}

/// Signal codes carried by `URLData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlDataCode {
    Data,
    Finished,
    ErrorCode,
    Headers,
    Redirect,
    MimeType,
    Connected,
    RequestData,
}

impl FromStr for UrlDataCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "0" => Self::Data,
            "1" => Self::Finished,
            "2" => Self::ErrorCode,
            "3" => Self::Headers,
            "4" => Self::Redirect,
            "5" => Self::MimeType,
            "6" => Self::Connected,
            "7" => Self::RequestData,
            _ => return Err(()),
        })
    }
}

/// Flow-control commands for a tunneled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCommand {
    Stop,
    Hold,
    Resume,
}

impl DataCommand {
    pub fn code(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Hold => 1,
            Self::Resume => 2,
        }
    }
}

/// Lifecycle states reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    ClassLoaded,
    Instantiated,
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

impl ProgramState {
    pub fn code(self) -> u8 {
        match self {
            Self::ClassLoaded => 1,
            Self::Instantiated => 2,
            Self::Initialized => 3,
            Self::Started => 4,
            Self::Stopped => 5,
            Self::Destroyed => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioAction {
    Play,
    Loop,
    Stop,
}

/// Outcome of a security confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDecision {
    Granted,
    Denied,
    /// Granted, and the host will not ask again for this signer.
    Remember,
}

impl TrustDecision {
    pub fn parse(reply: &str) -> Self {
        match reply.trim() {
            "yes" => Self::Granted,
            "always" => Self::Remember,
            _ => Self::Denied,
        }
    }

    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted | Self::Remember)
    }
}

/// Launch parameters for a hosted program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramSpec {
    pub name: String,
    pub class_name: String,
    pub document_base: String,
    pub code_base: Option<String>,
    pub archives: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Ordered `<param>` pairs, as written in the host document.
    pub parameters: Vec<(String, String)>,
}

impl ProgramSpec {
    /// Case-insensitive lookup, first match wins.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Frames the host sends to the bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    CreateContext {
        context: String,
    },
    DestroyContext {
        context: String,
    },
    CreateProgram {
        context: String,
        program: String,
        spec: ProgramSpec,
    },
    DestroyProgram {
        context: String,
        program: String,
    },
    InitProgram {
        context: String,
        program: String,
    },
    StartProgram {
        context: String,
        program: String,
    },
    StopProgram {
        context: String,
        program: String,
    },
    ShowConsole,
    ShutdownServer,
    UrlData {
        job: JobId,
        code: UrlDataCode,
        #[serde(skip)]
        data: Bytes,
    },
    GetMember {
        context: String,
        program: String,
        ticket: Ticket,
        object: ObjectId,
        name: String,
    },
    PutMember {
        context: String,
        program: String,
        ticket: Ticket,
        object: ObjectId,
        name: String,
        value: String,
    },
    CallMember {
        context: String,
        program: String,
        ticket: Ticket,
        object: ObjectId,
        name: String,
        args: Vec<String>,
    },
    DerefObject {
        context: String,
        program: String,
        object: ObjectId,
    },
    /// `PutMember` on [`EVAL_RETURN_MEMBER`]: the result of a pending `eval`.
    EvalReturn {
        context: String,
        program: String,
        value: String,
    },
    ScriptReturn {
        context: String,
        ticket: Ticket,
        kind: ValueKind,
        value: String,
    },
    SecurityReply {
        context: String,
        ticket: Ticket,
        decision: TrustDecision,
    },
}

struct FieldReader<'a> {
    command: Command,
    frame: &'a Frame,
    next: usize,
}

impl<'a> FieldReader<'a> {
    fn new(command: Command, frame: &'a Frame) -> Self {
        Self {
            command,
            frame,
            next: 0,
        }
    }

    fn raw(&mut self) -> Option<&'a Bytes> {
        let field = self.frame.get(self.next);
        self.next += 1;
        field
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, ProtocolError> {
        self.raw()
            .cloned()
            .ok_or(ProtocolError::MissingField {
                command: self.command,
                field,
            })
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        self.bytes(field)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Absent and empty both read as `None`.
    fn optional(&mut self) -> Option<String> {
        self.raw()
            .filter(|b| !b.is_empty())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    fn parse<T: FromStr>(&mut self, field: &'static str) -> Result<T, ProtocolError> {
        let value = self.string(field)?;
        value.trim().parse().map_err(|_| ProtocolError::InvalidField {
            command: self.command,
            field,
            value,
        })
    }

    fn count(&mut self, field: &'static str) -> Result<usize, ProtocolError> {
        match self.frame.get(self.next) {
            Some(raw) if !raw.is_empty() => self.parse(field),
            _ => {
                self.next += 1;
                Ok(0)
            }
        }
    }

    fn list(&mut self, field: &'static str) -> Result<Vec<String>, ProtocolError> {
        let count = self.count(field)?;
        (0..count).map(|_| self.string(field)).collect()
    }

    fn pairs(&mut self, field: &'static str) -> Result<Vec<(String, String)>, ProtocolError> {
        let count = self.count(field)?;
        (0..count)
            .map(|_| Ok::<_, ProtocolError>((self.string(field)?, self.string(field)?)))
            .collect()
    }
}

impl TryFrom<&Frame> for HostRequest {
    type Error = ProtocolError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let command = Command::try_from(frame.code())?;
        let mut f = FieldReader::new(command, frame);

        let request = match command {
            Command::CreateContext => Self::CreateContext {
                context: f.string("context")?,
            },
            Command::DestroyContext => Self::DestroyContext {
                context: f.string("context")?,
            },
            Command::CreateProgram => {
                let context = f.string("context")?;
                let program = f.string("program")?;
                let spec = ProgramSpec {
                    name: f.string("name")?,
                    class_name: f.string("class")?,
                    document_base: f.string("document_base")?,
                    code_base: f.optional(),
                    archives: f.optional(),
                    width: f.parse("width")?,
                    height: f.parse("height")?,
                    parameters: f.pairs("parameters")?,
                };
                Self::CreateProgram {
                    context,
                    program,
                    spec,
                }
            }
            Command::DestroyProgram => Self::DestroyProgram {
                context: f.string("context")?,
                program: f.string("program")?,
            },
            Command::InitProgram => Self::InitProgram {
                context: f.string("context")?,
                program: f.string("program")?,
            },
            Command::StartProgram => Self::StartProgram {
                context: f.string("context")?,
                program: f.string("program")?,
            },
            Command::StopProgram => Self::StopProgram {
                context: f.string("context")?,
                program: f.string("program")?,
            },
            Command::ShowConsole => Self::ShowConsole,
            Command::ShutdownServer => Self::ShutdownServer,
            Command::UrlData => Self::UrlData {
                job: JobId(f.parse("job")?),
                code: f.parse("code")?,
                data: f.raw().cloned().unwrap_or_default(),
            },
            Command::GetMember => Self::GetMember {
                context: f.string("context")?,
                program: f.string("program")?,
                ticket: Ticket(f.parse("ticket")?),
                object: ObjectId(f.parse("object")?),
                name: f.string("name")?,
            },
            Command::PutMember => {
                let context = f.string("context")?;
                let program = f.string("program")?;
                let ticket = Ticket(f.parse("ticket")?);
                let object = ObjectId(f.parse("object")?);
                let name = f.string("name")?;
                let value = f.string("value")?;
                if name == EVAL_RETURN_MEMBER {
                    Self::EvalReturn {
                        context,
                        program,
                        value,
                    }
                } else {
                    Self::PutMember {
                        context,
                        program,
                        ticket,
                        object,
                        name,
                        value,
                    }
                }
            }
            Command::CallMember => Self::CallMember {
                context: f.string("context")?,
                program: f.string("program")?,
                ticket: Ticket(f.parse("ticket")?),
                object: ObjectId(f.parse("object")?),
                name: f.string("name")?,
                args: f.list("args")?,
            },
            Command::DerefObject => Self::DerefObject {
                context: f.string("context")?,
                program: f.string("program")?,
                object: ObjectId(f.parse("object")?),
            },
            Command::ScriptReturn => Self::ScriptReturn {
                context: f.string("context")?,
                ticket: Ticket(f.parse("ticket")?),
                kind: f.parse("kind")?,
                value: f.optional().unwrap_or_default(),
            },
            Command::SecurityConfirm => Self::SecurityReply {
                context: f.string("context")?,
                ticket: Ticket(f.parse("ticket")?),
                decision: TrustDecision::parse(&f.string("decision")?),
            },
            other => return Err(ProtocolError::UnexpectedDirection(other)),
        };
        Ok(request)
    }
}

/// Frames the bridge sends to the host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    ProgramState {
        context: String,
        program: String,
        state: ProgramState,
    },
    ProgramFailed {
        context: String,
        program: String,
        message: String,
    },
    ShowDocument {
        context: String,
        url: String,
        frame: Option<String>,
    },
    ShowStatus {
        context: String,
        message: String,
    },
    ResizeProgram {
        context: String,
        program: String,
        width: u32,
        height: u32,
    },
    Audio {
        context: String,
        url: String,
        action: AudioAction,
    },
    GetUrlData {
        job: JobId,
        url: String,
    },
    PutUrlData {
        job: JobId,
        url: String,
    },
    PutData {
        job: JobId,
        #[serde(skip)]
        data: Bytes,
    },
    DataControl {
        job: JobId,
        command: DataCommand,
    },
    ScriptEvent {
        context: String,
        program: String,
        object: String,
        event: String,
        args: Vec<String>,
    },
    /// Answer to a host-issued `GetMember`, `PutMember` or `CallMember`.
    MemberReply {
        command: Command,
        context: String,
        program: String,
        ticket: Ticket,
        kind: ValueKind,
        value: String,
    },
    ScriptGetMember {
        context: String,
        program: String,
        ticket: Ticket,
        object: String,
        name: String,
    },
    ScriptCallMember {
        context: String,
        program: String,
        ticket: Ticket,
        object: String,
        name: String,
        args: Vec<String>,
    },
    SecurityConfirm {
        context: String,
        ticket: Ticket,
        permission: String,
        certificates: Vec<String>,
    },
}

fn push_list(frame: &mut Frame, items: Vec<String>) {
    frame.push(items.len().to_string());
    for item in items {
        frame.push(item);
    }
}

impl BridgeEvent {
    pub fn command(&self) -> Command {
        match self {
            Self::ProgramState { .. } => Command::ProgramState,
            Self::ProgramFailed { .. } => Command::ProgramFailed,
            Self::ShowDocument { frame: None, .. } => Command::ShowDocument,
            Self::ShowDocument { frame: Some(_), .. } => Command::ShowDocumentInFrame,
            Self::ShowStatus { .. } => Command::ShowStatus,
            Self::ResizeProgram { .. } => Command::ResizeProgram,
            Self::Audio { action, .. } => match action {
                AudioAction::Play => Command::AudioPlay,
                AudioAction::Loop => Command::AudioLoop,
                AudioAction::Stop => Command::AudioStop,
            },
            Self::GetUrlData { .. } => Command::GetUrlData,
            Self::PutUrlData { .. } => Command::PutUrlData,
            Self::PutData { .. } => Command::PutData,
            Self::DataControl { .. } => Command::DataControl,
            Self::ScriptEvent { .. } => Command::ScriptEvent,
            Self::MemberReply { command, .. } => *command,
            Self::ScriptGetMember { .. } => Command::ScriptGetMember,
            Self::ScriptCallMember { .. } => Command::ScriptCallMember,
            Self::SecurityConfirm { .. } => Command::SecurityConfirm,
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::new(self.command().code());
        match self {
            Self::ProgramState {
                context,
                program,
                state,
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(state.code().to_string());
            }
            Self::ProgramFailed {
                context,
                program,
                message,
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(message);
            }
            Self::ShowDocument {
                context,
                url,
                frame: target,
            } => {
                frame.push(context);
                frame.push(url);
                if let Some(target) = target {
                    frame.push(target);
                }
            }
            Self::ShowStatus { context, message } => {
                frame.push(context);
                frame.push(message);
            }
            Self::ResizeProgram {
                context,
                program,
                width,
                height,
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(width.to_string());
                frame.push(height.to_string());
            }
            Self::Audio { context, url, .. } => {
                frame.push(context);
                frame.push(url);
            }
            Self::GetUrlData { job, url } | Self::PutUrlData { job, url } => {
                frame.push(job.to_string());
                frame.push(url);
            }
            Self::PutData { job, data } => {
                frame.push(job.to_string());
                frame.push(data);
            }
            Self::DataControl { job, command } => {
                frame.push(job.to_string());
                frame.push(command.code().to_string());
            }
            Self::ScriptEvent {
                context,
                program,
                object,
                event,
                args,
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(object);
                frame.push(event);
                push_list(&mut frame, args);
            }
            Self::MemberReply {
                context,
                program,
                ticket,
                kind,
                value,
                ..
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(ticket.to_string());
                frame.push(kind.code().to_string());
                frame.push(value);
            }
            Self::ScriptGetMember {
                context,
                program,
                ticket,
                object,
                name,
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(ticket.to_string());
                frame.push(object);
                frame.push(name);
            }
            Self::ScriptCallMember {
                context,
                program,
                ticket,
                object,
                name,
                args,
            } => {
                frame.push(context);
                frame.push(program);
                frame.push(ticket.to_string());
                frame.push(object);
                frame.push(name);
                push_list(&mut frame, args);
            }
            Self::SecurityConfirm {
                context,
                ticket,
                permission,
                certificates,
            } => {
                frame.push(context);
                frame.push(ticket.to_string());
                frame.push(permission);
                push_list(&mut frame, certificates);
            }
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: Command, fields: &[&str]) -> Frame {
        let mut frame = Frame::new(command.code());
        for field in fields {
            frame.push(field.to_string());
        }
        frame
    }

    fn text(frame: &Frame) -> Vec<String> {
        frame
            .fields()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    #[test]
    fn command_codes_roundtrip() {
        for code in 1..=32u8 {
            let command = Command::try_from(code).unwrap();
            assert_eq!(command.code(), code);
        }
        assert!(matches!(
            Command::try_from(0),
            Err(ProtocolError::UnknownCommand(0))
        ));
        assert!(matches!(
            Command::try_from(33),
            Err(ProtocolError::UnknownCommand(33))
        ));
    }

    #[test]
    fn create_program_parses() {
        let f = frame(
            Command::CreateProgram,
            &[
                "ctx1",
                "p1",
                "demo",
                "Demo",
                "http://x/y.html",
                "",
                "",
                "100",
                "50",
                "1",
                "greeting",
                "hi",
            ],
        );
        let req = HostRequest::try_from(&f).unwrap();
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "create_program",
          "context": "ctx1",
          "program": "p1",
          "spec": {
            "name": "demo",
            "class_name": "Demo",
            "document_base": "http://x/y.html",
            "code_base": null,
            "archives": null,
            "width": 100,
            "height": 50,
            "parameters": [
              [
                "greeting",
                "hi"
              ]
            ]
          }
        }
        "#);
    }

    #[test]
    fn create_program_without_parameter_block() {
        let f = frame(
            Command::CreateProgram,
            &["c", "p", "n", "K", "http://d/", "http://d/code/", "a.jar", "1", "2"],
        );
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::CreateProgram { spec, .. } => {
                assert_eq!(spec.code_base.as_deref(), Some("http://d/code/"));
                assert_eq!(spec.archives.as_deref(), Some("a.jar"));
                assert!(spec.parameters.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let f = frame(Command::GetMember, &["ctx1", "p1", "4"]);
        match HostRequest::try_from(&f) {
            Err(ProtocolError::MissingField { command, field }) => {
                assert_eq!(command, Command::GetMember);
                assert_eq!(field, "object");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_number_is_rejected() {
        let f = frame(Command::CreateProgram, &["c", "p", "n", "K", "d", "", "", "wide", "2"]);
        assert!(matches!(
            HostRequest::try_from(&f),
            Err(ProtocolError::InvalidField { field: "width", .. })
        ));
    }

    #[test]
    fn eval_return_is_split_from_put_member() {
        let f = frame(
            Command::PutMember,
            &["ctx1", "p1", "7", "0", "__lc_ret", "3 someName"],
        );
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::EvalReturn {
                context, value, ..
            } => {
                assert_eq!(context, "ctx1");
                assert_eq!(value, "3 someName");
            }
            other => panic!("unexpected {other:?}"),
        }

        let f = frame(Command::PutMember, &["ctx1", "p1", "7", "2", "x", "5"]);
        assert!(matches!(
            HostRequest::try_from(&f).unwrap(),
            HostRequest::PutMember { ticket, .. } if ticket == Ticket::new(7)
        ));
    }

    #[test]
    fn call_member_reads_argument_list() {
        let f = frame(
            Command::CallMember,
            &["c", "p", "9", "0", "add", "2", "1", ""],
        );
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::CallMember { name, args, .. } => {
                assert_eq!(name, "add");
                assert_eq!(args, vec!["1".to_string(), String::new()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn url_data_without_payload() {
        let f = frame(Command::UrlData, &["12", "6"]);
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::UrlData { job, code, data } => {
                assert_eq!(job, JobId::new(12));
                assert_eq!(code, UrlDataCode::Connected);
                assert!(data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn script_return_carries_kind_and_value() {
        let f = frame(Command::ScriptReturn, &["ctx1", "41", "3", "2.5"]);
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::ScriptReturn {
                context,
                ticket,
                kind,
                value,
            } => {
                assert_eq!(context, "ctx1");
                assert_eq!(ticket, Ticket::new(41));
                assert_eq!(kind, ValueKind::Number);
                assert_eq!(value, "2.5");
            }
            other => panic!("unexpected {other:?}"),
        }

        let void = frame(Command::ScriptReturn, &["ctx1", "42", "0"]);
        match HostRequest::try_from(&void).unwrap() {
            HostRequest::ScriptReturn { kind, value, .. } => {
                assert_eq!(kind, ValueKind::Void);
                assert!(value.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let bad = frame(Command::ScriptReturn, &["ctx1", "43", "9", "x"]);
        assert!(matches!(
            HostRequest::try_from(&bad),
            Err(ProtocolError::InvalidField { .. })
        ));
    }

    #[test]
    fn security_confirm_inbound_is_a_reply() {
        let f = frame(Command::SecurityConfirm, &["ctx1", "7", "always"]);
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::SecurityReply {
                context,
                ticket,
                decision,
            } => {
                assert_eq!(context, "ctx1");
                assert_eq!(ticket, Ticket::new(7));
                assert_eq!(decision, TrustDecision::Remember);
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = frame(Command::SecurityConfirm, &["ctx1", "7"]);
        assert!(matches!(
            HostRequest::try_from(&missing),
            Err(ProtocolError::MissingField { .. })
        ));
    }

    #[test]
    fn deref_object_names_the_handle() {
        let f = frame(Command::DerefObject, &["ctx1", "p1", "17"]);
        match HostRequest::try_from(&f).unwrap() {
            HostRequest::DerefObject {
                context,
                program,
                object,
            } => {
                assert_eq!((context.as_str(), program.as_str()), ("ctx1", "p1"));
                assert_eq!(object, ObjectId::new(17));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bridge_commands_are_rejected_inbound() {
        let f = frame(Command::ShowStatus, &["c", "hello"]);
        assert!(matches!(
            HostRequest::try_from(&f),
            Err(ProtocolError::UnexpectedDirection(Command::ShowStatus))
        ));
    }

    #[test]
    fn security_reply_decisions() {
        assert_eq!(TrustDecision::parse("yes"), TrustDecision::Granted);
        assert_eq!(TrustDecision::parse("always"), TrustDecision::Remember);
        assert_eq!(TrustDecision::parse("no"), TrustDecision::Denied);
        assert_eq!(TrustDecision::parse(""), TrustDecision::Denied);
    }

    #[test]
    fn member_reply_frame_layout() {
        let frame = BridgeEvent::MemberReply {
            command: Command::GetMember,
            context: "ctx1".into(),
            program: "p1".into(),
            ticket: Ticket::new(3),
            kind: ValueKind::Error,
            value: "no such context".into(),
        }
        .into_frame();
        assert_eq!(frame.code(), 16);
        assert_eq!(text(&frame), ["ctx1", "p1", "3", "-1", "no such context"]);
    }

    #[test]
    fn show_document_picks_code_by_target() {
        let plain = BridgeEvent::ShowDocument {
            context: "c".into(),
            url: "http://a/".into(),
            frame: None,
        }
        .into_frame();
        let framed = BridgeEvent::ShowDocument {
            context: "c".into(),
            url: "http://a/".into(),
            frame: Some("_blank".into()),
        }
        .into_frame();
        assert_eq!(plain.code(), Command::ShowDocument.code());
        assert_eq!(framed.code(), Command::ShowDocumentInFrame.code());
        assert_eq!(text(&framed), ["c", "http://a/", "_blank"]);
    }

    #[test]
    fn script_event_serializes() {
        let event = BridgeEvent::ScriptEvent {
            context: "ctx1".into(),
            program: "p1".into(),
            object: "0".into(),
            event: "eval".into(),
            args: vec!["document.title".into()],
        };
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "script_event",
          "context": "ctx1",
          "program": "p1",
          "object": "0",
          "event": "eval",
          "args": [
            "document.title"
          ]
        }
        "#);
        assert_eq!(
            text(&event.into_frame()),
            ["ctx1", "p1", "0", "eval", "1", "document.title"]
        );
    }
}
