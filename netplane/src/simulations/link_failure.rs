use crate::Simulation;
use netplane_core::{ExitStatus, ProtocolType};

/// Converges the triangle, takes down R1's link to R3 halfway through, and
/// lets OSPF route around it for the remaining ticks.
pub async fn link_failure(sim: &Simulation, ticks: u64) -> anyhow::Result<ExitStatus> {
    sim.start().await?;
    let before = ticks / 2;
    let status = sim.run(before).await;
    if status != ExitStatus::TickLimit {
        return Ok(status);
    }

    let r1 = sim
        .device("R1")
        .ok_or_else(|| anyhow::anyhow!("The topology has no R1"))?;
    sim.topology().set_interface_state(&r1, "Gi0/1", false).await?;
    tracing::info!(
        protocol = %ProtocolType::Ospf,
        "R1 Gi0/1 is down after {} ticks",
        before
    );
    Ok(sim.run(ticks - before).await)
}
