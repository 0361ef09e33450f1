use serde::{Serialize, Deserialize};

/// Client-to-server messages. Each one travels as a single JSON text frame
/// tagged by `type`; the tag strings are the stable wire names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionJoin {
        session_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    SessionLeave {
        session_id: String,
        user_id: String,
    },
    TerminalAttach {
        workspace_id: String,
        terminal_id: String,
        auth_token: String,
        shell: String,
    },
    TerminalDetach {
        workspace_id: String,
        terminal_id: String,
    },
    TerminalInput {
        workspace_id: String,
        terminal_id: String,
        data: String,
    },
    TerminalResize {
        workspace_id: String,
        terminal_id: String,
        rows: u16,
        cols: u16,
    },
}

/// Server-to-client messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TerminalReady {
        workspace_id: String,
        cwd: String,
    },
    TerminalData {
        workspace_id: String,
        #[serde(default)]
        terminal_id: Option<String>,
        data: String,
    },
    TerminalError {
        error: String,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Wire name of the message, for logging without payload contents.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionJoin { .. } => "session_join",
            ClientMessage::SessionLeave { .. } => "session_leave",
            ClientMessage::TerminalAttach { .. } => "terminal_attach",
            ClientMessage::TerminalDetach { .. } => "terminal_detach",
            ClientMessage::TerminalInput { .. } => "terminal_input",
            ClientMessage::TerminalResize { .. } => "terminal_resize",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_encodes_wire_name_and_keys() {
        let msg = ClientMessage::SessionJoin {
            session_id: "s1".into(),
            user_id: "u1".into(),
            auth_token: None,
        };
        let json = msg.encode();
        assert!(json.contains("\"type\":\"session_join\""));
        assert!(json.contains("\"session_id\":\"s1\""));
        assert!(json.contains("\"user_id\":\"u1\""));
        // Absent token is omitted entirely, not sent as null.
        assert!(!json.contains("auth_token"));
    }

    #[test]
    fn attach_carries_token_and_shell() {
        let msg = ClientMessage::TerminalAttach {
            workspace_id: "w1".into(),
            terminal_id: "%1".into(),
            auth_token: "tok".into(),
            shell: "/bin/zsh".into(),
        };
        let json = msg.encode();
        assert!(json.contains("\"type\":\"terminal_attach\""));
        assert!(json.contains("\"auth_token\":\"tok\""));
        assert!(json.contains("\"shell\":\"/bin/zsh\""));
        assert_eq!(msg.kind(), "terminal_attach");
    }

    #[test]
    fn resize_roundtrips() {
        let msg = ClientMessage::TerminalResize {
            workspace_id: "w1".into(),
            terminal_id: "%2".into(),
            rows: 40,
            cols: 120,
        };
        let back: ClientMessage = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn terminal_data_without_id_decodes() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"terminal_data","workspace_id":"w1","data":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::TerminalData { workspace_id: "w1".into(), terminal_id: None, data: "hi".into() }
        );
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"mystery"}"#).is_err());
    }
}
