use std::{collections::BTreeSet, fmt::Debug, sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, StatefulSet},
        core::v1::{ConfigMap, Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use kube_runtime::{Controller, controller::Action, events::EventType, watcher};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Config,
    consts::FIELD_MANAGER,
    crd::{Mode, Prometheus, PrometheusAgent, PrometheusRule, PrometheusWorkload},
    error::Error,
    event::{Ctx, Outcome, emit_advisories, emit_event, with_event},
    rules::{
        RuleFiles, make_rules_config_maps, render_rule_file, rule_config_map_prefix,
        selector_string,
    },
    service::make_governing_service,
    volumes::TlsAssets,
    web::make_web_config_secret,
    workload::{INPUT_HASH_ANNOTATION, Workload, make_workload, object_name},
};

const REQUEUE_SUCCESS: Duration = Duration::from_secs(60);
const REQUEUE_ERROR: Duration = Duration::from_secs(10);

/// Runs the Prometheus and PrometheusAgent controllers until a shutdown
/// signal is received.
pub async fn run(client: Client, config: Config) -> Result<(), Error> {
    let ctx = Arc::new(Ctx::new(client.clone(), config));

    let servers = Controller::new(
        Api::<Prometheus>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(
        Api::<StatefulSet>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(
        Api::<ConfigMap>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        reconcile_workload::<Prometheus>,
        error_policy::<Prometheus>,
        ctx.clone(),
    )
    .for_each(|result| async move {
        match result {
            Ok((obj, action)) => debug!(%obj, ?action, "Prometheus reconciled"),
            Err(e) => error!(error = %e, "Prometheus reconciliation failed"),
        }
    });

    let agents = Controller::new(
        Api::<PrometheusAgent>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(
        Api::<DaemonSet>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(Api::<StatefulSet>::all(client), watcher::Config::default())
    .shutdown_on_signal()
    .run(
        reconcile_workload::<PrometheusAgent>,
        error_policy::<PrometheusAgent>,
        ctx,
    )
    .for_each(|result| async move {
        match result {
            Ok((obj, action)) => debug!(%obj, ?action, "PrometheusAgent reconciled"),
            Err(e) => error!(error = %e, "PrometheusAgent reconciliation failed"),
        }
    });

    info!("starting controllers");
    futures::join!(servers, agents);
    info!("controllers stopped");
    Ok(())
}

#[instrument(skip_all, fields(kind = %resource.mode(), name = %resource.name_any(), namespace = ?resource.namespace()))]
pub async fn reconcile_workload<P>(resource: Arc<P>, ctx: Arc<Ctx>) -> Result<Action, Error>
where
    P: PrometheusWorkload + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let ns = resource
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = resource.name_any();
    let config = &ctx.config;

    let rule_config_maps = match resource.mode() {
        Mode::Server => reconcile_rules(&ctx, &*resource, &ns).await?,
        Mode::Agent => Vec::new(),
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    apply(&secrets, &make_web_config_secret(&*resource, config)?).await?;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    apply(&services, &make_governing_service(&*resource, config)).await?;

    let object = object_name(resource.mode(), &name);
    let tls_assets = TlsAssets::new(vec![format!("{object}-tls-assets-0")]);

    let built = match make_workload(&*resource, config, &tls_assets, &rule_config_maps) {
        Ok(built) => built,
        Err(e) => {
            warn!(error = %e, "failed to build workload");
            let _ = emit_event(
                &ctx,
                &*resource,
                "InvalidConfiguration",
                &e.to_string(),
                EventType::Warning,
            )
            .await;
            return Err(e);
        }
    };
    emit_advisories(&ctx, &*resource, &built.advisories).await;

    let outcome = with_event(
        &ctx,
        &*resource,
        "WorkloadApplied",
        &format!("Applied {object}"),
        "WorkloadApplyFailed",
        apply_workload(&ctx.client, &ns, &built.workload),
    )
    .await?;
    info!(?outcome, workload = %object, "reconciled");

    Ok(Action::requeue(REQUEUE_SUCCESS))
}

pub fn error_policy<P>(resource: Arc<P>, error: &Error, _ctx: Arc<Ctx>) -> Action
where
    P: PrometheusWorkload,
{
    warn!(name = %resource.name_any(), error = %error, "reconciliation failed, requeueing");
    Action::requeue(REQUEUE_ERROR)
}

/// Packs the selected rules into ConfigMaps, applies them and deletes the
/// ones left over from a previous packing. Returns the ConfigMap names.
async fn reconcile_rules<P>(ctx: &Ctx, resource: &P, ns: &str) -> Result<Vec<String>, Error>
where
    P: PrometheusWorkload,
{
    let rule_files = select_rule_files(&ctx.client, ns, resource.rule_selector()).await?;
    debug!(count = rule_files.len(), "selected rule files");

    let config_maps = make_rules_config_maps(resource, &rule_files, &ctx.config)?;
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), ns);
    for config_map in &config_maps {
        apply(&api, config_map).await?;
    }

    let names: Vec<String> = config_maps.iter().map(|cm| cm.name_any()).collect();
    delete_stale_rule_config_maps(&api, &ctx.config, &resource.name_any(), &names).await?;
    Ok(names)
}

/// No selector selects no rules; an empty selector selects every rule in the
/// namespace.
async fn select_rule_files(
    client: &Client,
    ns: &str,
    selector: Option<&LabelSelector>,
) -> Result<RuleFiles, Error> {
    let Some(selector) = selector else {
        return Ok(RuleFiles::new());
    };

    let api: Api<PrometheusRule> = Api::namespaced(client.clone(), ns);
    let rules = api
        .list(&ListParams::default().labels(&selector_string(selector)))
        .await?;
    rules.items.iter().map(render_rule_file).collect()
}

async fn delete_stale_rule_config_maps(
    api: &Api<ConfigMap>,
    config: &Config,
    name: &str,
    keep: &[String],
) -> Result<(), Error> {
    let keep: BTreeSet<&str> = keep.iter().map(String::as_str).collect();
    let prefix = rule_config_map_prefix(name);
    let selector = format!("{}={name}", config.label_conventions.name);

    for config_map in api.list(&ListParams::default().labels(&selector)).await?.items {
        let cm_name = config_map.name_any();
        if cm_name.starts_with(&prefix) && !keep.contains(cm_name.as_str()) {
            api.delete(&cm_name, &DeleteParams::default()).await?;
            info!(config_map = %cm_name, "deleted stale rule ConfigMap");
        }
    }
    Ok(())
}

async fn apply_workload(client: &Client, ns: &str, workload: &Workload) -> Result<Outcome, Error> {
    match workload {
        Workload::DaemonSet(ds) => apply(&Api::namespaced(client.clone(), ns), ds).await,
        Workload::StatefulSet(sts) => apply(&Api::namespaced(client.clone(), ns), sts).await,
    }
}

/// Server-side applies `obj`. Objects carrying an input hash are left alone
/// when the live object has the same hash.
async fn apply<K>(api: &Api<K>, obj: &K) -> Result<Outcome, Error>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))?;

    let outcome = match api.get_opt(&name).await? {
        None => Outcome::Created,
        Some(live) => {
            let desired_hash = input_hash(obj);
            if desired_hash.is_some() && desired_hash == input_hash(&live) {
                debug!(%name, "unchanged, skipping apply");
                return Ok(Outcome::NoOp);
            }
            Outcome::Updated
        }
    };

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(obj),
    )
    .await?;
    debug!(%name, ?outcome, "applied");
    Ok(outcome)
}

fn input_hash<K: Resource>(obj: &K) -> Option<&String> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(INPUT_HASH_ANNOTATION))
}
