use kube::runtime::events::{Event, EventType};
use kube::{Client, Resource};
use kube_runtime::events::{Recorder, Reporter};
use tracing::warn;

use crate::{config::Config, consts::FIELD_MANAGER, error::Error, version::Advisory};

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: Recorder,
    pub config: Config,
}

impl Ctx {
    pub fn new(client: Client, config: Config) -> Self {
        let recorder = Recorder::new(client.clone(), make_reporter());
        Self {
            client,
            recorder,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoOp,
    Created,
    Updated,
}

pub fn make_reporter() -> Reporter {
    Reporter {
        controller: FIELD_MANAGER.into(),
        instance: std::env::var("POD_NAME").ok(),
    }
}

pub async fn emit_event<K>(
    ctx: &Ctx,
    obj: &K,
    reason: &str,
    note: &str,
    event_type: EventType,
) -> Result<(), Error>
where
    K: Resource<DynamicType = ()>,
{
    ctx.recorder
        .publish(
            &Event {
                type_: event_type,
                reason: reason.into(),
                note: Some(note.into()),
                action: reason.into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await?;

    Ok(())
}

/// Publishes one warning per feature left out of the generated workload.
pub async fn emit_advisories<K>(ctx: &Ctx, obj: &K, advisories: &[Advisory])
where
    K: Resource<DynamicType = ()>,
{
    for advisory in advisories {
        if let Err(e) = emit_event(
            ctx,
            obj,
            "UnsupportedFeature",
            &advisory.to_string(),
            EventType::Warning,
        )
        .await
        {
            warn!(error = %e, "failed to publish event");
        }
    }
}

/// Runs `op` and records its outcome as an event on `obj`: a normal event
/// when something changed, a warning carrying the error otherwise.
pub async fn with_event<E, K>(
    ctx: &Ctx,
    obj: &K,
    success_reason: &str,
    success_msg: &str,
    fail_reason: &str,
    op: impl std::future::Future<Output = Result<Outcome, E>>,
) -> Result<Outcome, E>
where
    E: std::fmt::Display,
    K: Resource<DynamicType = ()>,
{
    match op.await {
        Ok(outcome) => {
            match outcome {
                Outcome::Created | Outcome::Updated => {
                    let _ =
                        emit_event(ctx, obj, success_reason, success_msg, EventType::Normal).await;
                }
                Outcome::NoOp => {}
            }
            Ok(outcome)
        }
        Err(e) => {
            let _ = emit_event(ctx, obj, fail_reason, &e.to_string(), EventType::Warning).await;
            Err(e)
        }
    }
}
