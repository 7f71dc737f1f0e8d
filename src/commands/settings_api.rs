use crate::client::ChatClient;
use crate::peer::types::ServerConfig;
use tauri::{command, State};

/// returns the new camera state
#[command]
pub fn toggle_camera(client: State<'_, ChatClient>) -> bool {
    client.toggle_camera()
}

#[command]
pub fn toggle_microphone(client: State<'_, ChatClient>) -> bool {
    client.toggle_microphone()
}

/// Applies to the next session; an empty list restores the default STUN servers.
#[command]
pub fn set_ice_servers(client: State<'_, ChatClient>, servers: Vec<ServerConfig>) -> Result<(), String> {
    client.set_ice_servers(servers).map_err(|e| e.to_string())
}

#[command]
pub fn get_ice_servers(client: State<'_, ChatClient>) -> Vec<ServerConfig> {
    client.ice_servers()
}
