//! Client-to-server transaction translation.

use std::collections::{BTreeSet, HashMap};

use error_stack::Report;

use tessera_core::{
    Action, ActionKind, Allocation, BootCount, ClientActionKind, ClientTxn, Positions, ReplicaId,
    Topology, Txn, VarId, VarRef,
};
use tessera_paxos::Connections;

use crate::cache::PositionCache;
use crate::error::SubmitError;
use crate::picker::CombinationPicker;

fn bare_refs(references: &[VarId]) -> Vec<VarRef> {
    references
        .iter()
        .map(|&var| VarRef {
            var,
            positions: None,
        })
        .collect()
}

/// Translate a client transaction into a server transaction plus its active
/// and passive replica sets.
///
/// For each action the responsible replicas are the top `two_f_inc` entries
/// of the object's permutation; a `Create` generates fresh positions first.
/// Reference positions are back-patched after all actions are processed, so
/// references to objects created later in the same transaction resolve.
pub(crate) fn client_to_server(
    ctxn: &ClientTxn,
    local: ReplicaId,
    boot_count: BootCount,
    topology: &Topology,
    cache: &mut PositionCache,
    disabled: &BTreeSet<ReplicaId>,
    connections: &Connections,
) -> Result<(Txn, Vec<ReplicaId>, Vec<ReplicaId>), Report<SubmitError>> {
    if ctxn.actions.len() > usize::from(u16::MAX) {
        return Err(Report::new(SubmitError::TooManyActions));
    }
    let two_f_inc = usize::from(topology.two_f_inc);
    let mut picker = CombinationPicker::new(usize::from(topology.f_inc), disabled.clone());
    let mut actions = Vec::with_capacity(ctxn.actions.len());
    let mut created: HashMap<VarId, Positions> = HashMap::new();
    let mut action_indices: HashMap<ReplicaId, Vec<u16>> = HashMap::new();

    for (idx, client_action) in ctxn.actions.iter().enumerate() {
        let idx16 = u16::try_from(idx).expect("length checked above");
        let var = client_action.var;

        let (kind, fresh_permutation) = match &client_action.kind {
            ClientActionKind::Read { version } => (ActionKind::Read { version: *version }, None),
            ClientActionKind::Write { value, references } => (
                ActionKind::Write {
                    value: value.clone(),
                    references: bare_refs(references),
                },
                None,
            ),
            ClientActionKind::ReadWrite {
                version,
                value,
                references,
            } => (
                ActionKind::ReadWrite {
                    version: *version,
                    value: value.clone(),
                    references: bare_refs(references),
                },
                None,
            ),
            ClientActionKind::Create { value, references } => {
                let (positions, permutation) =
                    cache.create_positions(var, usize::from(topology.max_replica_count));
                created.insert(var, positions.clone());
                (
                    ActionKind::Create {
                        value: value.clone(),
                        positions,
                        references: bare_refs(references),
                    },
                    Some(permutation),
                )
            }
            ClientActionKind::Roll {
                version,
                value,
                references,
            } => (
                ActionKind::Roll {
                    version: *version,
                    value: value.clone(),
                    references: bare_refs(references),
                },
                None,
            ),
        };

        let permutation = match fresh_permutation {
            Some(permutation) => permutation,
            None => {
                let permutation = cache
                    .hash_codes(&var)
                    .ok_or_else(|| Report::new(SubmitError::UnknownVar(var)))?;
                // Rolls may only be submitted by the object's leading
                // replica.
                if matches!(client_action.kind, ClientActionKind::Roll { .. })
                    && permutation.first() != Some(&local)
                {
                    return Err(Report::new(SubmitError::AbortRoll)
                        .attach(format!("{var} is not led by {local}")));
                }
                permutation
            }
        };

        if permutation.len() < two_f_inc {
            return Err(Report::new(SubmitError::Infeasible)
                .attach(format!("{var} resolves to fewer than 2f+1 replicas")));
        }
        let responsible = &permutation[..two_f_inc];
        picker.add_permutation(responsible);
        for &replica in responsible {
            action_indices.entry(replica).or_default().push(idx16);
        }
        actions.push(Action { var, kind });
    }

    let (active, passive) = picker
        .choose()
        .map_err(|e| Report::new(SubmitError::Infeasible).attach(e.to_string()))?;

    // References may point at objects created by this very transaction, so
    // positions are patched only once every action has been processed.
    for action in &mut actions {
        for reference in action.kind.references_mut() {
            if reference.positions.is_some() {
                continue;
            }
            let positions = created
                .get(&reference.var)
                .or_else(|| cache.get_positions(&reference.var))
                .ok_or_else(|| Report::new(SubmitError::UnknownVar(reference.var)))?;
            reference.positions = Some(positions.clone());
        }
    }

    let mut allocations = Vec::with_capacity(active.len() + passive.len());
    for replica in &active {
        let Some(conn) = connections.get(replica) else {
            return Err(Report::new(SubmitError::Infeasible)
                .attach(format!("active {replica} has no connection")));
        };
        allocations.push(allocation(replica, conn.boot_count(), &mut action_indices));
    }
    for replica in &passive {
        allocations.push(allocation(replica, BootCount(0), &mut action_indices));
    }

    let txn = Txn {
        id: ctxn.id,
        retry: ctxn.retry,
        submitter: local,
        submitter_boot_count: boot_count,
        f_inc: topology.f_inc,
        topology_version: topology.version,
        actions,
        allocations,
    };
    Ok((txn, active, passive))
}

fn allocation(
    replica: &ReplicaId,
    active: BootCount,
    action_indices: &mut HashMap<ReplicaId, Vec<u16>>,
) -> Allocation {
    let mut indices = action_indices.remove(replica).unwrap_or_default();
    indices.sort_unstable();
    Allocation {
        replica: *replica,
        action_indices: indices,
        active,
    }
}
