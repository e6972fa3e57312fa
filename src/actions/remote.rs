//! Commands run on every ship through an ambassador container
//!
//! The ambassador is the deploy image started on the ship with the engine
//! and Dominator's state directories mounted. It reads the part of the
//! shipment placed on its ship from stdin and runs the matching local
//! command there.

use super::{print, Output};
use crate::entities::{Container, Image, Ship, Shipment, Volume};
use crate::error::Result;
use crate::harbor::Harbor;
use crate::logging;
use crate::settings::DOCKER_SOCKET;
use tracing::Instrument;

pub const AMBASSADOR_NAME: &str = "dominator-ambassador";

/// Local command an ambassador runs on its ship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Start,
    Restart,
    Status { show_diff: bool },
}

impl RemoteCommand {
    /// Arguments of the local command for `ship`
    pub fn args(&self, ship: &str, container: Option<&str>) -> Vec<String> {
        let mut args = match self {
            RemoteCommand::Start => vec!["localstart".to_string()],
            RemoteCommand::Restart => vec!["localrestart".to_string()],
            RemoteCommand::Status { .. } => vec!["localstatus".to_string(), ship.to_string()],
        };
        args.extend(container.map(str::to_string));
        if let RemoteCommand::Status { show_diff: true } = self {
            args.push("-d".to_string());
        }
        args
    }

    /// Whether the ambassador's output is the command's result
    pub fn prints(&self) -> bool {
        matches!(self, RemoteCommand::Status { .. })
    }
}

/// The ambassador container for `ship`
pub fn ambassador(harbor: &Harbor, ship: &Ship, command: &RemoteCommand, container: Option<&str>) -> Container {
    let settings = harbor.settings();
    let mut ambassador = Container::new(
        AMBASSADOR_NAME,
        &ship.name,
        Image::new(&settings.deploy_image, settings),
    );
    ambassador.hostname = Some(ship.name.clone());
    ambassador.volumes.insert(
        "dominator".to_string(),
        Volume::bind("/var/lib/dominator", "/var/lib/dominator"),
    );
    ambassador.volumes.insert(
        "docker-sock".to_string(),
        Volume::bind(DOCKER_SOCKET, DOCKER_SOCKET),
    );

    let mut args = vec!["dominator".to_string()];
    if !command.prints() {
        args.extend(["-l".to_string(), "debug".to_string()]);
    }
    args.extend(["-c".to_string(), "-".to_string()]);
    args.extend(command.args(&ship.name, container));
    ambassador.command = Some(args.join(" "));
    ambassador.stdin_once = true;
    ambassador
}

/// Run `command` on every ship holding a matching container
///
/// Returns the highest exit code of the ambassadors.
pub async fn remote(
    harbor: &Harbor,
    shipment: &Shipment,
    command: RemoteCommand,
    ship: Option<&str>,
    container: Option<&str>,
    keep: bool,
    out: Output<'_>,
) -> Result<i64> {
    let mut exit_code = 0;
    for (ship_name, containers) in Shipment::group(shipment.filter(ship, container)) {
        let ship = match shipment.ships.get(&ship_name) {
            Some(ship) => ship.clone(),
            None => continue,
        };
        let cargo = shipment.subset(containers).to_yaml()?;
        let span = tracing::info_span!(target: logging::CONTAINER, "ambassador", ship = %ship.name);
        let code = run_ambassador(harbor, &ship, &command, container, &cargo, keep, &mut *out)
            .instrument(span)
            .await?;
        exit_code = exit_code.max(code);
    }
    Ok(exit_code)
}

async fn run_ambassador(
    harbor: &Harbor,
    ship: &Ship,
    command: &RemoteCommand,
    container: Option<&str>,
    cargo: &str,
    keep: bool,
    out: Output<'_>,
) -> Result<i64> {
    let docker = harbor.ship(ship)?;
    let mut ambassador = ambassador(harbor, ship, command, container);
    tracing::debug!(target: logging::CONTAINER, command = ?ambassador.command, "starting ambassador");

    let result: Result<i64> = async {
        let mut output = ambassador.launch(harbor, ship).await?;
        docker.send_stdin(&ambassador.state.id, cargo.as_bytes()).await?;
        while let Some(line) = output.next_line().await {
            let line = line?;
            if command.prints() {
                print(&mut *out, &line);
            } else {
                tracing::info!(target: logging::DOCKER_LOGS, ship = %ship.name, "{}", line);
            }
        }
        ambassador.wait(docker.as_ref()).await
    }
    .await;

    // an ambassador left running would hold the name for the next launch
    ambassador.halt(docker.as_ref()).await;
    let cleanup = if keep || ambassador.state.id.is_empty() {
        Ok(())
    } else {
        ambassador.remove(docker.as_ref(), true).await
    };

    let code = result?;
    cleanup?;
    if code != 0 {
        tracing::warn!(target: logging::CONTAINER, code, "ambassador exited with an error");
    }
    Ok(code)
}
