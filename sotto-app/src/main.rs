//! Sotto daemon entry point.
//!
//! Wires the real adapters into the recording coordinator: cpal capture,
//! the streaming recognizer transport, the desktop system probe and the
//! clipboard-paste sink. The push-to-talk key drives `user_start` /
//! `user_stop`; everything else is the coordinator's business.

mod hotkey;
mod injector;
mod settings;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sotto_core::audio::CpalCapture;
use sotto_core::system::DesktopProbe;
use sotto_core::transport::AsrTransport;
use sotto_core::{Adapters, Coordinator, UiEvent};

use hotkey::{HotkeyEvent, HotkeyListener};
use injector::PasteSink;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sotto=info")),
        )
        .init();

    let settings_path = settings::default_settings_path();
    let app_settings = settings::load_settings(&settings_path);
    if !app_settings.has_credentials() {
        // Write a template so the user has something to fill in.
        if !settings_path.exists() {
            if let Err(e) = settings::save_settings(&settings_path, &app_settings) {
                warn!(error = %e, "could not write settings template");
            }
        }
        bail!(
            "missing recognizer credentials — set appKey/accessKey in {} \
             or export SOTTO_APP_KEY / SOTTO_ACCESS_KEY",
            settings_path.display()
        );
    }

    let key = hotkey::parse_key(&app_settings.push_to_talk_key).with_context(|| {
        format!(
            "unknown push-to-talk key '{}'",
            app_settings.push_to_talk_key
        )
    })?;

    let cfg = app_settings.coordinator_config();
    let adapters = Adapters {
        capture: Arc::new(CpalCapture::new(cfg.sample_rate, cfg.frame_samples())),
        transport: Arc::new(AsrTransport::new(
            app_settings.transport_config(),
            cfg.sample_rate,
        )),
        probe: Arc::new(DesktopProbe::for_endpoint(&app_settings.endpoint)),
        sink: Arc::new(PasteSink::spawn()?),
    };
    let coordinator = Coordinator::spawn(cfg, adapters);

    let (hotkey_tx, mut hotkey_rx) = tokio::sync::mpsc::channel(16);
    let _listener = HotkeyListener::start(key, hotkey_tx);
    info!(
        key = %app_settings.push_to_talk_key,
        "ready — hold the key to dictate"
    );

    let mut ui = coordinator.subscribe_ui();
    loop {
        tokio::select! {
            Some(event) = hotkey_rx.recv() => match event {
                HotkeyEvent::Pressed => coordinator.user_start(),
                HotkeyEvent::Released => coordinator.user_stop(),
            },
            result = ui.recv() => {
                if let Ok(event) = result {
                    render_ui_event(event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                coordinator.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}

fn render_ui_event(event: UiEvent) {
    match event {
        UiEvent::StateChanged { from, to } => info!(?from, ?to, "state"),
        UiEvent::Status { text: Some(text) } => info!("{text}"),
        UiEvent::Status { text: None } => {}
        UiEvent::ErrorBanner { message } => error!("{message}"),
        UiEvent::Transcript { text, is_final } => {
            if is_final {
                info!(transcript = %text, "finalized");
            } else {
                info!(transcript = %text, "partial");
            }
        }
    }
}
