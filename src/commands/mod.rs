//! Tauri bridge for the desktop shell.
//!
//! ```ignore
//! let client = tauri::async_runtime::block_on(ChatClient::connect(config))?;
//! tauri::Builder::default().plugin(onvia_lib::commands::init(client))
//! ```
//!
//! Client events are re-emitted to the webview as `onvia-<event name>`.

pub mod session_api;
pub mod settings_api;

use crate::client::ChatClient;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, Runtime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub fn init<R: Runtime>(client: ChatClient) -> TauriPlugin<R> {
    Builder::new("onvia")
        .invoke_handler(tauri::generate_handler![
            session_api::start_chat,
            session_api::find_partner,
            session_api::cancel_search,
            session_api::skip,
            session_api::end_chat,
            session_api::send_chat_message,
            session_api::report_user,
            session_api::snapshot,
            settings_api::toggle_camera,
            settings_api::toggle_microphone,
            settings_api::set_ice_servers,
            settings_api::get_ice_servers,
        ])
        .setup(move |app, _api| {
            forward_events(app.clone(), &client);
            app.manage(client);
            Ok(())
        })
        .build()
}

fn forward_events<R: Runtime>(app: AppHandle<R>, client: &ChatClient) {
    let mut events = client.subscribe();
    tauri::async_runtime::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let name = format!("onvia-{}", event.name());
                    if let Err(e) = app.emit(&name, &event) {
                        warn!("Failed to emit event {name}: {e:?}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("webview fell behind; {skipped} events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("event forwarding stopped");
    });
}
