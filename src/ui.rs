use std::sync::Arc;
use std::time::Duration;

use egui::{Button, Color32, Frame, RichText, Stroke, Vec2};
use tracing::{debug, info};

use crate::capture::CaptureHandle;
use crate::mqtt::mqtt_handler::ConnectionHandle;
use crate::mqtt::state::ConnectionState;
use crate::mqtt::topics::SessionTopicNamespace;
use crate::status::StatusReporter;

const REPAINT_INTERVAL: Duration = Duration::from_millis(250);

pub struct UiColors;

impl UiColors {
    pub const MAIN_BG: Color32 = Color32::from_rgb(30, 30, 30);
    pub const INNER_BG: Color32 = Color32::from_rgb(25, 25, 25);
    pub const BORDER: Color32 = Color32::from_rgb(60, 60, 60);

    /// Connected
    pub const ACTIVE: Color32 = Color32::from_rgb(50, 200, 20);
    /// Connecting or reconnecting
    pub const PENDING: Color32 = Color32::from_rgb(220, 170, 20);
    /// Disconnected
    pub const INACTIVE: Color32 = Color32::from_rgb(200, 50, 20);

    pub fn for_state(state: ConnectionState) -> Color32 {
        match state {
            ConnectionState::Connected => Self::ACTIVE,
            ConnectionState::Connecting | ConnectionState::Reconnecting => Self::PENDING,
            ConnectionState::Disconnected => Self::INACTIVE,
        }
    }
}

/// Status window. Only reads the status slot and the connection state and
/// hands button presses to the capture worker, so it never blocks.
pub struct PhotolinkUI {
    status: Arc<StatusReporter>,
    connection: ConnectionHandle,
    capture: CaptureHandle,
    topics: Arc<SessionTopicNamespace>,
}

impl PhotolinkUI {
    pub fn new(
        _cc: &eframe::CreationContext<'_>,
        status: Arc<StatusReporter>,
        connection: ConnectionHandle,
        capture: CaptureHandle,
        topics: Arc<SessionTopicNamespace>,
    ) -> Self {
        info!("Starting UI for session {}", topics.base());
        Self {
            status,
            connection,
            capture,
            topics,
        }
    }

    fn connection_row(&self, ui: &mut egui::Ui) {
        let state = self.connection.state();
        ui.horizontal(|ui| {
            ui.label(RichText::new("●").color(UiColors::for_state(state)));
            ui.label(format!("MQTT {}", state));
            ui.separator();
            ui.label(RichText::new(self.topics.base()).monospace());
        });
    }

    fn status_frame(&self, ui: &mut egui::Ui) {
        let record = self.status.current();
        let color = if record.message.starts_with("ERROR: ") {
            UiColors::INACTIVE
        } else if record.message.starts_with("SUCCESS: ") {
            UiColors::ACTIVE
        } else {
            ui.visuals().text_color()
        };

        Frame::new()
            .fill(UiColors::INNER_BG)
            .stroke(Stroke::new(1.0, UiColors::BORDER))
            .inner_margin(8.0)
            .show(ui, |ui| {
                ui.set_width(ui.available_width());
                ui.label(RichText::new(record.to_string()).size(18.0).color(color));
            });
    }

    fn capture_button(&self, ui: &mut egui::Ui) {
        let busy = self.capture.is_busy();
        let label = if busy { "Capturing..." } else { "Take photo" };
        let button = Button::new(RichText::new(label).size(22.0)).min_size(Vec2 {
            x: ui.available_width(),
            y: 60.0,
        });

        if ui.add_enabled(!busy, button).clicked() {
            debug!("Take photo pressed");
            // Rejections are reported on the status line
            let _ = self.capture.on_trigger_capture();
        }
    }
}

impl eframe::App for PhotolinkUI {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint_after(REPAINT_INTERVAL);

        egui::CentralPanel::default()
            .frame(Frame::new().fill(UiColors::MAIN_BG).inner_margin(12.0))
            .show(ctx, |ui| {
                ui.heading("photolink");
                ui.add_space(8.0);
                self.connection_row(ui);
                ui.add_space(8.0);
                self.status_frame(ui);
                ui.add_space(16.0);
                self.capture_button(ui);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_is_green() {
        for state in ConnectionState::ALL {
            assert_eq!(
                UiColors::for_state(state) == UiColors::ACTIVE,
                state == ConnectionState::Connected
            );
        }
    }
}
