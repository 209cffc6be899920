use std::collections::BTreeSet;

use crate::{crd::Argument, error::Error};

/// Renders the operator-managed arguments followed by the user's additional
/// arguments. Additional arguments may not redefine (or negate) a managed one.
pub fn build_args(managed: Vec<Argument>, additional: &[Argument]) -> Result<Vec<String>, Error> {
    let managed_names: BTreeSet<&str> = managed.iter().map(|a| a.name.as_str()).collect();

    let conflicts: Vec<String> = additional
        .iter()
        .filter(|arg| {
            let name = arg.name.as_str();
            let negated = match name.strip_prefix("no-") {
                Some(positive) => managed_names.contains(positive),
                None => managed_names.contains(format!("no-{name}").as_str()),
            };
            managed_names.contains(name) || negated
        })
        .map(|arg| arg.name.clone())
        .collect();

    if !conflicts.is_empty() {
        return Err(Error::ArgumentConflict(conflicts));
    }

    Ok(managed
        .iter()
        .chain(additional)
        .map(render_arg)
        .collect())
}

fn render_arg(arg: &Argument) -> String {
    if arg.value.is_empty() {
        format!("--{}", arg.name)
    } else {
        format!("--{}={}", arg.name, arg.value)
    }
}
