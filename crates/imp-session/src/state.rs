//! Session state machine

use std::fmt;

/// Current mode of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    FrontendConfigured,
    SweepConfigured,
    Measuring,
    Stopped,
    /// Channel failed; only disconnect is possible
    Errored,
}

/// Operations gated by the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Disconnect,
    SetFsSettings,
    QueryFsSettings,
    SetSetup,
    StartMeasurement,
    StopMeasurement,
    /// Read the measurement stream
    ReadMeasurements,
    Reset,
}

impl SessionState {
    /// Whether `op` may be called in this state
    pub fn allows(self, op: Operation) -> bool {
        use Operation::*;
        use SessionState::*;

        match self {
            Disconnected => matches!(op, Connect),
            Connected => matches!(op, SetFsSettings | QueryFsSettings | Reset | Disconnect),
            FrontendConfigured => matches!(
                op,
                SetSetup | SetFsSettings | QueryFsSettings | Reset | Disconnect
            ),
            SweepConfigured => matches!(
                op,
                StartMeasurement | SetSetup | SetFsSettings | QueryFsSettings | Reset | Disconnect
            ),
            Measuring => matches!(op, StopMeasurement | ReadMeasurements),
            Stopped => matches!(op, SetSetup | StartMeasurement | Reset | Disconnect),
            Errored => matches!(op, Disconnect),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::FrontendConfigured => "frontend configured",
            SessionState::SweepConfigured => "sweep configured",
            SessionState::Measuring => "measuring",
            SessionState::Stopped => "stopped",
            SessionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::SetFsSettings => "set_fs_settings",
            Operation::QueryFsSettings => "query_fs_settings",
            Operation::SetSetup => "set_setup",
            Operation::StartMeasurement => "start_measurement",
            Operation::StopMeasurement => "stop_measurement",
            Operation::ReadMeasurements => "measurements",
            Operation::Reset => "reset",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_OPS: [Operation; 9] = [
        Operation::Connect,
        Operation::Disconnect,
        Operation::SetFsSettings,
        Operation::QueryFsSettings,
        Operation::SetSetup,
        Operation::StartMeasurement,
        Operation::StopMeasurement,
        Operation::ReadMeasurements,
        Operation::Reset,
    ];

    fn allowed(state: SessionState) -> Vec<Operation> {
        ALL_OPS.into_iter().filter(|op| state.allows(*op)).collect()
    }

    #[test]
    fn test_measuring_only_allows_stop_and_reading() {
        assert_eq!(
            allowed(SessionState::Measuring),
            vec![Operation::StopMeasurement, Operation::ReadMeasurements]
        );
    }

    #[test]
    fn test_errored_only_allows_disconnect() {
        assert_eq!(allowed(SessionState::Errored), vec![Operation::Disconnect]);
    }

    #[test]
    fn test_start_requires_sweep() {
        assert!(!SessionState::Connected.allows(Operation::StartMeasurement));
        assert!(!SessionState::FrontendConfigured.allows(Operation::StartMeasurement));
        assert!(SessionState::SweepConfigured.allows(Operation::StartMeasurement));
        assert!(SessionState::Stopped.allows(Operation::StartMeasurement));
    }

    #[test]
    fn test_setup_requires_frontend() {
        assert!(!SessionState::Connected.allows(Operation::SetSetup));
        assert!(SessionState::FrontendConfigured.allows(Operation::SetSetup));
    }

    #[test]
    fn test_stopped_cannot_change_frontend() {
        assert!(!SessionState::Stopped.allows(Operation::SetFsSettings));
        assert!(!SessionState::Stopped.allows(Operation::QueryFsSettings));
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::SweepConfigured.to_string(), "sweep configured");
        assert_eq!(Operation::StartMeasurement.to_string(), "start_measurement");
    }
}
