//! Token relocation along cluster branch topology.

use crate::model::{Cluster, Token};
use crate::params::SimulationParameters;

/// Decides where tokens travel within a cluster during a step.
pub trait TokenRouter: Send + Sync {
    /// Static identifier of the routing strategy.
    fn kind(&self) -> &'static str;

    /// Destination cell index for the tokens currently on `cell_index`, or `None` to stay.
    fn route(
        &self,
        cluster: &Cluster,
        cell_index: usize,
        params: &SimulationParameters,
    ) -> Option<usize>;
}

/// Moves tokens to the first connected cell carrying the next branch number.
///
/// Branch numbers wrap at `cell_max_token_branch_number`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchNumberRouter;

impl TokenRouter for BranchNumberRouter {
    fn kind(&self) -> &'static str {
        "branch-number"
    }

    fn route(
        &self,
        cluster: &Cluster,
        cell_index: usize,
        params: &SimulationParameters,
    ) -> Option<usize> {
        let cell = cluster.cells.get(cell_index)?;
        let max = params.cell_max_token_branch_number.max(1);
        let next = (cell.token_branch_number + 1) % max;
        cell.connections.iter().copied().find(|&idx| {
            idx != cell_index
                && cluster
                    .cells
                    .get(idx)
                    .is_some_and(|candidate| candidate.token_branch_number == next)
        })
    }
}

/// Keeps every token on its current cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct StationaryRouter;

impl TokenRouter for StationaryRouter {
    fn kind(&self) -> &'static str {
        "stationary"
    }

    fn route(&self, _: &Cluster, _: usize, _: &SimulationParameters) -> Option<usize> {
        None
    }
}

/// Resolve every destination against the unmodified cluster, then move tokens.
///
/// Arriving tokens are appended after the tokens that stayed, in source-cell
/// order. Returns the number of tokens moved.
pub(crate) fn route_cluster(
    cluster: &mut Cluster,
    router: &dyn TokenRouter,
    params: &SimulationParameters,
) -> usize {
    let len = cluster.cells.len();
    let destinations: Vec<Option<usize>> = (0..len)
        .map(|idx| {
            if cluster.cells[idx].tokens.is_empty() {
                None
            } else {
                router
                    .route(cluster, idx, params)
                    .filter(|&dest| dest != idx && dest < len)
            }
        })
        .collect();

    let mut arrivals: Vec<Vec<Token>> = (0..len).map(|_| Vec::new()).collect();
    let mut moved = 0;
    for (idx, destination) in destinations.into_iter().enumerate() {
        if let Some(dest) = destination {
            let tokens = std::mem::take(&mut cluster.cells[idx].tokens);
            moved += tokens.len();
            arrivals[dest].extend(tokens);
        }
    }
    for (cell, incoming) in cluster.cells.iter_mut().zip(arrivals) {
        cell.tokens.extend(incoming);
    }
    moved
}
