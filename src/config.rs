use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
    pub ws_url: String,
    pub api_base_url: String,
    pub attachment_base_url: String,
    pub number: String,
    pub device_id: u32,
    pub signaling_key: [u8; 32],
    pub credentials: Credentials,
    pub keepalive_path: String,
    pub keepalive_disconnect: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://localhost/v1/websocket/".to_string(),
            api_base_url: "https://localhost".to_string(),
            attachment_base_url: "https://localhost".to_string(),
            number: String::new(),
            device_id: 1,
            signaling_key: [0u8; 32],
            credentials: Credentials {
                username: String::new(),
                password: String::new(),
            },
            keepalive_path: "/v1/keepalive".to_string(),
            keepalive_disconnect: true,
        }
    }
}
