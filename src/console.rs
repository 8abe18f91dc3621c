//! Line-oriented console: command parsing and text rendering.

use std::fmt::Write;
use std::time::Duration;

use crate::catalog::{self, Seguimiento};
use crate::controller::CallStatus;
use crate::state_machine::CallState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Call,
    HangUp,
    ToggleMute,
    Status,
    Chat(String),
    Track(String),
    Areas,
    Tramites(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then(|| rest.to_string());

        let cmd = match word.to_lowercase().as_str() {
            "llamar" => ConsoleCommand::Call,
            "colgar" => ConsoleCommand::HangUp,
            "silencio" => ConsoleCommand::ToggleMute,
            "estado" => ConsoleCommand::Status,
            "chat" => match arg {
                Some(text) => ConsoleCommand::Chat(text),
                None => ConsoleCommand::Unknown(line.to_string()),
            },
            "radicado" => ConsoleCommand::Track(rest.to_string()),
            "areas" | "áreas" => ConsoleCommand::Areas,
            "tramites" | "trámites" => ConsoleCommand::Tramites(arg),
            "ayuda" | "help" => ConsoleCommand::Help,
            "salir" | "exit" => ConsoleCommand::Quit,
            _ => ConsoleCommand::Unknown(line.to_string()),
        };
        Some(cmd)
    }
}

pub const HELP: &str = "\
Comandos:
  llamar              iniciar llamada de voz
  colgar              terminar la llamada
  silencio            activar/desactivar micrófono
  estado              estado de la llamada
  chat <texto>        preguntar al asistente de texto
  radicado <id>       consultar un trámite (ej. RAD-2024-001)
  areas               listar secretarías
  tramites [area]     listar trámites
  ayuda               esta ayuda
  salir               cerrar";

/// `mm:ss`; minutes keep growing past 59.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

pub fn render_status(status: &CallStatus) -> String {
    let mut out = String::from(status.state.label());
    if status.state == CallState::Active {
        if let Some(at) = status.connected_at {
            let _ = write!(out, " {}", format_duration(at.elapsed()));
        }
    }
    if status.muted {
        out.push_str(" [micrófono silenciado]");
    }
    if let Some(err) = &status.last_error {
        let _ = write!(out, " (último error: {})", err);
    }
    out
}

/// Whether an observer should be told: call state, mute or a new error.
pub fn status_changed(shown: &CallStatus, current: &CallStatus) -> bool {
    shown.state != current.state || shown.muted != current.muted || shown.last_error != current.last_error
}

pub fn render_seguimiento(radicado: &str) -> String {
    match catalog::lookup(radicado) {
        Some(found) => render_found(found),
        None => catalog::NOT_FOUND_MESSAGE.to_string(),
    }
}

fn render_found(s: &Seguimiento) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} · {}", s.id_radicado, s.tramite_nombre);
    let _ = writeln!(out, "  Área: {}", s.area_nombre);
    let _ = writeln!(out, "  Estado: {}", s.estado);
    let _ = writeln!(out, "  Radicado el {} · actualizado el {}", s.fecha_radicacion, s.ultima_actualizacion);
    for event in s.historial {
        let _ = writeln!(out, "  - {} {}: {}", event.fecha, event.evento, event.detalle);
    }
    out.trim_end().to_string()
}

pub fn render_areas() -> String {
    catalog::AREAS
        .iter()
        .map(|a| format!("{:<11} {}: {}", a.id, a.nombre, a.descripcion))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_tramites(area_id: Option<&str>) -> String {
    let list = catalog::tramites(area_id);
    if list.is_empty() {
        return "No hay trámites registrados para esa área.".to_string();
    }
    let mut out = String::new();
    for t in list {
        let _ = writeln!(out, "{} ({})", t.nombre, t.tiempo_estimado);
        let _ = writeln!(out, "  {}", t.descripcion);
        let _ = writeln!(out, "  Requisitos: {}", t.requisitos.join(", "));
    }
    out.trim_end().to_string()
}
