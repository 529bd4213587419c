pub mod capture;
pub mod config;
pub mod mqtt;
pub mod network;
pub mod status;
pub mod ui;

#[cfg(test)]
mod testing;

use crate::capture::{CaptureHandle, CapturePipeline, CommandCamera};
use crate::config::AppConfig;
use crate::mqtt::mqtt_handler::{ConnectionManager, ReconnectPolicy};
use crate::mqtt::topics::SessionTopicNamespace;
use crate::mqtt::transport::MqttTransport;
use crate::network::NetworkProbe;
use crate::status::StatusReporter;
use crate::ui::PhotolinkUI;
use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use eframe::egui;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load_or_create().await?;
    let status = Arc::new(StatusReporter::new("Starting..."));

    // Ein Namensraum pro Programmlauf
    let topics = Arc::new(SessionTopicNamespace::from_seed(
        &config.topics.root,
        Local::now().timestamp_millis(),
    ));
    info!("Publishing under {}", topics.base());

    let transport = MqttTransport::new(config.broker.clone(), config.capture.max_message_size);
    let connection = ConnectionManager::spawn(
        transport,
        config.topics.client_prefix.clone(),
        ReconnectPolicy::from(&config.reconnect),
        topics.clone(),
        status.clone(),
    );

    let probe = NetworkProbe::from_config(&config);
    let camera = CommandCamera::from_config(&config.capture);
    let pipeline = CapturePipeline::new(
        camera,
        probe,
        connection.clone(),
        status.clone(),
        topics.clone(),
        config.pipeline_policy(),
    );
    let capture = CaptureHandle::spawn(pipeline);

    // Erste Verbindung im Hintergrund, das Ergebnis landet in der Statuszeile
    status.set("Connecting to MQTT broker...");
    connection.request_connect().await;

    info!("Starting UI");
    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("photolink")
            .with_inner_size([480.0, 320.0]),
        ..Default::default()
    };

    let ui_connection = connection.clone();
    let ui_status = status.clone();
    eframe::run_native(
        "photolink",
        native_options,
        Box::new(move |cc| {
            Ok(Box::new(PhotolinkUI::new(
                cc,
                ui_status,
                ui_connection,
                capture,
                topics,
            )))
        }),
    )
    .map_err(|e| eyre!("UI failed: {}", e))?;

    // Fenster geschlossen, Sitzung sauber beenden
    info!("UI closed, disconnecting");
    connection.disconnect().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
