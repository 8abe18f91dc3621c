use std::fmt;

/// Lifecycle of one voice call.
///
/// `Idle -> Connecting -> Active -> Idle`; any failure goes straight back to
/// `Idle` through a full teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Active,
}

impl CallState {
    pub fn can_start(self) -> bool {
        self == CallState::Idle
    }

    /// Label shown on the console status line.
    pub fn label(self) -> &'static str {
        match self {
            CallState::Idle => "Canal Privado",
            CallState::Connecting => "Conectando...",
            CallState::Active => "Llamada Segura",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
        };
        f.write_str(name)
    }
}
