//! User-facing progress notifications.
//!
//! The lifecycle controller announces each risky step before attempting it so
//! a failure mid-step can be attributed without a backtrace. Each
//! notification is an [`Event`] plus a key/value payload; turning that into
//! prose is the sink's business. The default sink just logs.

use std::fmt;

use tracing::info;

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Tip,
    Running,
    Restarting,
    Waiting,
    StartingVm,
    StartingNone,
    Provisioner,
    Provisioning,
    Shutdown,
    Stopping,
    DeletingHost,
    Deprecation,
    Warning,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tip => "tip",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Waiting => "waiting",
            Self::StartingVm => "starting-vm",
            Self::StartingNone => "starting-none",
            Self::Provisioner => "provisioner",
            Self::Provisioning => "provisioning",
            Self::Shutdown => "shutdown",
            Self::Stopping => "stopping",
            Self::DeletingHost => "deleting-host",
            Self::Deprecation => "deprecation",
            Self::Warning => "warning",
        };
        f.write_str(s)
    }
}

/// Key/value pairs attached to an event.
pub type Payload<'a> = &'a [(&'static str, String)];

/// Sink for progress events. Purely observational.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event, payload: Payload<'_>);
}

/// Logs every event at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: Event, payload: Payload<'_>) {
        info!(event = %event, "{}", render(payload));
    }
}

/// `k1=v1 k2=v2`, in payload order.
pub fn render(payload: Payload<'_>) -> String {
    payload
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_keeps_payload_order() {
        let payload = [("name", "p1".to_string()), ("driver", "kvm2".to_string())];
        assert_eq!(render(&payload), "name=p1 driver=kvm2");
        assert_eq!(render(&[]), "");
    }

    #[test]
    fn event_names_are_kebab_case() {
        assert_eq!(Event::DeletingHost.to_string(), "deleting-host");
        assert_eq!(Event::StartingVm.to_string(), "starting-vm");
    }
}
