//! Commands run against a loaded shipment
//!
//! Local commands act on containers placed on ships that are this machine and
//! talk to the engine at `docker-url`. The remote ones drive an ambassador
//! container on every ship (see [`remote`]).

pub mod remote;

pub use remote::{remote, RemoteCommand, AMBASSADOR_NAME};

use crate::compare::{Change, Difference};
use crate::entities::{Container, Ship, Shipment};
use crate::error::{DominatorError, Result};
use crate::harbor::Harbor;
use crate::logging;
use crossterm::style::Stylize;
use std::collections::BTreeSet;
use std::io::Write;

/// Where command output goes
pub type Output<'a> = &'a mut (dyn Write + Send);

/// Exit code of `status` when a running container differs
pub const EXIT_DIFFERS: i32 = 2;

fn print(out: &mut (dyn Write + Send), line: &str) {
    if let Err(e) = writeln!(out, "{}", line) {
        tracing::debug!(error = %e, "could not write output");
    }
}

/// The ship as seen from itself: reached through `docker-url`
fn from_aboard(ship: &Ship) -> Ship {
    Ship {
        local: true,
        ..ship.clone()
    }
}

/// Matching containers placed on this machine, with their ships
fn local_selection(
    shipment: &Shipment,
    ship: Option<&str>,
    container: Option<&str>,
) -> Result<Vec<(Ship, Container)>> {
    let mut selected = Vec::new();
    for c in shipment.filter(ship, container) {
        let ship = shipment.ship(&c)?;
        if ship.is_local() {
            selected.push((from_aboard(ship), c));
        }
    }
    Ok(selected)
}

/// Matching containers with the ships they run on
fn selection(
    shipment: &Shipment,
    ship: Option<&str>,
    container: Option<&str>,
) -> Result<Vec<(Ship, Container)>> {
    shipment
        .filter(ship, container)
        .into_iter()
        .map(|c| Ok((shipment.ship(&c)?.clone(), c)))
        .collect()
}

/// The shipment as YAML, with every image pinned
pub async fn dump(harbor: &Harbor, shipment: &Shipment) -> Result<String> {
    let mut shipment = shipment.clone();
    shipment.pin_images(harbor).await?;
    shipment.to_yaml()
}

/// Names of the containers placed on this machine
pub fn list_containers(shipment: &Shipment) -> Vec<String> {
    shipment
        .local_containers()
        .into_iter()
        .map(|c| c.name.clone())
        .collect()
}

/// Bring matching local containers in line with the shipment
pub async fn localstart(harbor: &Harbor, shipment: &Shipment, container: Option<&str>) -> Result<()> {
    for (ship, mut container) in local_selection(shipment, None, container)? {
        container.run(harbor, &ship).await?;
    }
    Ok(())
}

/// Stop matching local containers and start them afresh
pub async fn localrestart(harbor: &Harbor, shipment: &Shipment, container: Option<&str>) -> Result<()> {
    for (ship, mut container) in local_selection(shipment, None, container)? {
        let docker = harbor.ship(&ship)?;
        container.check(docker.as_ref()).await?;
        if container.running() {
            container.stop(docker.as_ref()).await?;
        }
        container.run(harbor, &ship).await?;
    }
    Ok(())
}

/// Run a local container until it stops, printing its output
pub async fn localexec(
    harbor: &Harbor,
    shipment: &Shipment,
    container: &str,
    keep: bool,
    out: Output<'_>,
) -> Result<()> {
    let selected = local_selection(shipment, None, Some(container))?;
    if selected.is_empty() {
        return Err(DominatorError::Container(format!(
            "no local container named {}",
            container
        )));
    }
    for (ship, mut container) in selected {
        let docker = harbor.ship(&ship)?;
        container
            .execute(harbor, &ship, |line| print(&mut *out, line))
            .await?;
        if !keep {
            container.check(docker.as_ref()).await?;
            if !container.state.id.is_empty() {
                container.remove(docker.as_ref(), false).await?;
            }
        }
    }
    Ok(())
}

/// One status line: ship, name, short id and status in fixed columns
pub fn status_line(container: &Container) -> String {
    let id: String = container.state.id.chars().take(7).collect();
    format!(
        "{:10.10} {:20.20} {:10.10} {:30.30}",
        container.ship, container.name, id, container.state.status
    )
}

/// One row per difference: the key, then the actual value in red and the
/// expected one in green; file diffs get a row per line
fn print_diff(out: &mut (dyn Write + Send), diff: &[Difference]) {
    for difference in diff {
        let key = difference.key();
        match &difference.change {
            Change::Value { expected, actual } => {
                let actual = format!("{:30.30}", actual).red();
                let expected = format!("{:30.30}", expected).green();
                print(out, &format!("  {:60.60} {} {}", key, actual, expected));
            }
            Change::Lines(lines) => {
                for line in lines {
                    let line = match line.get(..2) {
                        Some("- ") => line.as_str().red().to_string(),
                        Some("+ ") => line.as_str().green().to_string(),
                        Some("? ") => line.as_str().blue().to_string(),
                        _ => line.clone(),
                    };
                    print(out, &format!("  {:60.60} {}", key, line));
                }
            }
        }
    }
}

/// Print the state of matching local containers
///
/// Returns true when a running container differs from the shipment.
pub async fn localstatus(
    harbor: &Harbor,
    shipment: &Shipment,
    ship: Option<&str>,
    container: Option<&str>,
    show_diff: bool,
    out: Output<'_>,
) -> Result<bool> {
    let mut differs = false;
    for (ship, mut container) in local_selection(shipment, ship, container)? {
        let docker = harbor.ship(&ship)?;
        container.check(docker.as_ref()).await?;
        if !container.running() {
            print(out, &status_line(&container).red().to_string());
            continue;
        }

        let diff = container.diff(harbor, &ship).await?;
        if diff.is_empty() {
            print(out, &status_line(&container).green().to_string());
        } else {
            differs = true;
            print(out, &status_line(&container).yellow().to_string());
            if show_diff {
                print_diff(out, &diff);
            }
        }
    }
    Ok(differs)
}

/// Stop matching running containers on their ships
pub async fn stop(
    harbor: &Harbor,
    shipment: &Shipment,
    ship: Option<&str>,
    container: Option<&str>,
) -> Result<()> {
    for (ship, mut container) in selection(shipment, ship, container)? {
        let docker = harbor.ship(&ship)?;
        container.check(docker.as_ref()).await?;
        if container.running() {
            container.stop(docker.as_ref()).await?;
        } else {
            tracing::info!(target: logging::CONTAINER, container = %container, "container is not running");
        }
    }
    Ok(())
}

/// Print the logs of matching containers
pub async fn logs(
    harbor: &Harbor,
    shipment: &Shipment,
    ship: Option<&str>,
    container: Option<&str>,
    follow: bool,
    out: Output<'_>,
) -> Result<()> {
    for (ship, mut container) in selection(shipment, ship, container)? {
        let docker = harbor.ship(&ship)?;
        container.check(docker.as_ref()).await?;
        container
            .logs(docker.as_ref(), follow, |line| print(&mut *out, line))
            .await?;
    }
    Ok(())
}

/// Build and push source images whose tag is not available yet
pub async fn build(harbor: &Harbor, shipment: &Shipment, container: Option<&str>) -> Result<()> {
    let docker = harbor.local()?;
    let mut ready = BTreeSet::new();
    for mut container in shipment.filter(None, container) {
        if !container.image.is_source() {
            continue;
        }
        // each recipe gets its own tag, so a repository may hold several;
        // a recipe already built resolves to the existing image
        let id = container.image.resolve_id(docker.as_ref()).await?;
        if ready.insert(container.image.to_string()) {
            tracing::info!(target: logging::IMAGE, image = %container.image, id = %id, "image is ready");
        }
    }
    Ok(())
}
