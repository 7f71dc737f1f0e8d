use crate::client::{ChatClient, ChatMessage, ClientSnapshot};
use crate::signaling::ReportReason;
use tauri::{command, State};

// Commands return the error text; the webview shows it as is.

/// media prompt + matchmaking
#[command]
pub async fn start_chat(client: State<'_, ChatClient>) -> Result<(), String> {
    client.start_chat().await.map_err(|e| e.to_string())
}

#[command]
pub async fn find_partner(client: State<'_, ChatClient>) -> Result<(), String> {
    client.find_partner().await.map_err(|e| e.to_string())
}

#[command]
pub async fn cancel_search(client: State<'_, ChatClient>) -> Result<bool, String> {
    client.cancel_search().await.map_err(|e| e.to_string())
}

/// next stranger
#[command]
pub async fn skip(client: State<'_, ChatClient>) -> Result<(), String> {
    client.skip().await.map_err(|e| e.to_string())
}

#[command]
pub async fn end_chat(client: State<'_, ChatClient>) -> Result<(), String> {
    client.end_chat().await.map_err(|e| e.to_string())
}

#[command]
pub async fn send_chat_message(
    client: State<'_, ChatClient>,
    text: String,
) -> Result<ChatMessage, String> {
    client
        .send_chat_message(text)
        .await
        .map_err(|e| e.to_string())
}

#[command]
pub async fn report_user(
    client: State<'_, ChatClient>,
    reason: ReportReason,
    details: String,
) -> Result<(), String> {
    client
        .report_user(reason, details)
        .await
        .map_err(|e| e.to_string())
}

#[command]
pub async fn snapshot(client: State<'_, ChatClient>) -> Result<ClientSnapshot, String> {
    client.snapshot().await.map_err(|e| e.to_string())
}
