use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::info;

use crate::api::{CamelApp, CamelAppPhase};
use crate::Error;

/// Emit a Normal/AppUpdated event when the app phase changed between two
/// reconciles. Same phase means no event.
pub async fn notify_app_updated(
    client: Client,
    reporter: Reporter,
    previous: Option<&CamelApp>,
    target: &CamelApp,
) -> Result<(), kube::Error> {
    let old_phase = phase_of(previous);
    let new_phase = phase_of(Some(target));
    if old_phase == new_phase {
        return Ok(());
    }

    let name = target.metadata.name.clone().unwrap_or_default();
    let note = phase_changed_message(&name, &new_phase);
    info!("{note}");

    let recorder = Recorder::new(client, reporter, target.object_ref(&()));
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: "AppUpdated".into(),
            note: Some(note),
            action: "Reconciling".into(),
            secondary: None,
        })
        .await
}

/// Emit a Warning/AppError event for a failed reconcile pass, attached to
/// whichever of target/previous exists.
pub async fn notify_app_error(
    client: Client,
    reporter: Reporter,
    previous: Option<&CamelApp>,
    target: Option<&CamelApp>,
    error: &Error,
) -> Result<(), kube::Error> {
    let Some(app) = target.or(previous) else {
        return Ok(());
    };

    let name = app.metadata.name.clone().unwrap_or_default();
    let recorder = Recorder::new(client, reporter, app.object_ref(&()));
    recorder
        .publish(Event {
            type_: EventType::Warning,
            reason: "AppError".into(),
            note: Some(error_message(&name, error)),
            action: "Reconciling".into(),
            secondary: None,
        })
        .await
}

fn phase_of(app: Option<&CamelApp>) -> String {
    app.and_then(|a| a.status.as_ref())
        .and_then(|s| s.phase.as_ref())
        .map(CamelAppPhase::to_string)
        .unwrap_or_default()
}

fn phase_changed_message(name: &str, phase: &str) -> String {
    let phase = if phase.is_empty() { "[none]" } else { phase };
    format!("App \"{name}\" in phase \"{phase}\"")
}

fn error_message(name: &str, error: &Error) -> String {
    format!("Cannot reconcile App {name}: {error}")
}
