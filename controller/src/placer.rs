use std::collections::HashSet;

use uuid::Uuid;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("not enough eligible servers to satisfy the requested replicas")]
    InsufficientCapacity,
}

pub type Result<T> = std::result::Result<T, Error>;

/// How many replicas of a service one server should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub server_id: Uuid,
    pub count: u32,
}

/// A server eligible to receive replicas, with its current load (active
/// deployment count across all services).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: Uuid,
    pub load: i64,
}

/// The placement-relevant slice of a service's declared spec.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub replicas: u32,
    pub stateful: bool,
    pub auto_place: bool,
    pub locked_server_id: Option<Uuid>,
    /// User-supplied `{server, count}` rows, honoured when `auto_place` is
    /// off.
    pub explicit: Vec<(Uuid, u32)>,
}

/// Pure placement. Never touches state; callers persist the output. Policies
/// in priority order: stateful pinning, auto spread, explicit rows.
pub fn place(request: &PlacementRequest, candidates: &[Candidate]) -> Result<Vec<Placement>> {
    if request.stateful {
        return place_stateful(request.locked_server_id, candidates);
    }

    if request.auto_place {
        return place_spread(request.replicas, candidates);
    }

    place_explicit(request.replicas, &request.explicit, candidates)
}

/// A stateful service runs exactly one replica. Pinned services go to their
/// locked server; unpinned ones to the eligible server with the smallest id,
/// so repeated calls agree.
fn place_stateful(locked: Option<Uuid>, candidates: &[Candidate]) -> Result<Vec<Placement>> {
    if let Some(server_id) = locked {
        return Ok(vec![Placement {
            server_id,
            count: 1,
        }]);
    }

    candidates
        .iter()
        .map(|c| c.id)
        .min()
        .map(|server_id| {
            vec![Placement {
                server_id,
                count: 1,
            }]
        })
        .ok_or(Error::InsufficientCapacity)
}

/// Spread: every server gets ⌊N/S⌋ replicas, the remainder lands on the
/// least-loaded servers, ties broken by lexicographic server id.
fn place_spread(replicas: u32, candidates: &[Candidate]) -> Result<Vec<Placement>> {
    if replicas == 0 {
        return Ok(Vec::new());
    }
    if candidates.is_empty() {
        return Err(Error::InsufficientCapacity);
    }

    let mut order: Vec<&Candidate> = candidates.iter().collect();
    order.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));

    let base = replicas / order.len() as u32;
    let remainder = replicas as usize % order.len();

    let placements = order
        .iter()
        .enumerate()
        .map(|(i, candidate)| Placement {
            server_id: candidate.id,
            count: base + u32::from(i < remainder),
        })
        .filter(|p| p.count > 0)
        .collect();

    Ok(placements)
}

/// Explicit rows pass through verbatim, minus offline servers. Residual
/// demand after filtering is a capacity error, not a silent re-spread.
fn place_explicit(
    replicas: u32,
    rows: &[(Uuid, u32)],
    candidates: &[Candidate],
) -> Result<Vec<Placement>> {
    let eligible: HashSet<Uuid> = candidates.iter().map(|c| c.id).collect();

    let placements: Vec<Placement> = rows
        .iter()
        .filter(|(server_id, count)| eligible.contains(server_id) && *count > 0)
        .map(|(server_id, count)| Placement {
            server_id: *server_id,
            count: *count,
        })
        .collect();

    let total: u32 = placements.iter().map(|p| p.count).sum();
    if total < replicas {
        return Err(Error::InsufficientCapacity);
    }

    Ok(placements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u128, load: i64) -> Candidate {
        Candidate {
            id: Uuid::from_u128(id),
            load,
        }
    }

    fn request(replicas: u32) -> PlacementRequest {
        PlacementRequest {
            replicas,
            stateful: false,
            auto_place: true,
            locked_server_id: None,
            explicit: Vec::new(),
        }
    }

    #[test]
    fn spread_five_replicas_over_two_servers() {
        let a = candidate(1, 0);
        let b = candidate(2, 0);

        let placements = place(&request(5), &[b, a]).unwrap();

        // Equal load: the lower id takes the remainder.
        assert_eq!(
            placements,
            vec![
                Placement {
                    server_id: a.id,
                    count: 3
                },
                Placement {
                    server_id: b.id,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn spread_prefers_less_loaded_servers_for_remainder() {
        let a = candidate(1, 9);
        let b = candidate(2, 1);

        let placements = place(&request(3), &[a, b]).unwrap();
        assert_eq!(
            placements,
            vec![
                Placement {
                    server_id: b.id,
                    count: 2
                },
                Placement {
                    server_id: a.id,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn spread_with_more_servers_than_replicas() {
        let candidates = [candidate(1, 0), candidate(2, 0), candidate(3, 0)];

        let placements = place(&request(2), &candidates).unwrap();
        let total: u32 = placements.iter().map(|p| p.count).sum();
        assert_eq!(total, 2);
        assert_eq!(placements.len(), 2);
    }

    #[test]
    fn spread_needs_at_least_one_server() {
        assert_eq!(place(&request(1), &[]), Err(Error::InsufficientCapacity));
        assert_eq!(place(&request(0), &[]).unwrap(), Vec::new());
    }

    #[test]
    fn stateful_pins_to_locked_server() {
        let locked = Uuid::from_u128(7);
        let request = PlacementRequest {
            replicas: 1,
            stateful: true,
            auto_place: false,
            locked_server_id: Some(locked),
            explicit: Vec::new(),
        };

        let placements = place(&request, &[candidate(1, 0)]).unwrap();
        assert_eq!(
            placements,
            vec![Placement {
                server_id: locked,
                count: 1
            }]
        );
    }

    #[test]
    fn unpinned_stateful_is_deterministic() {
        let request = PlacementRequest {
            replicas: 1,
            stateful: true,
            auto_place: true,
            locked_server_id: None,
            explicit: Vec::new(),
        };

        let first = place(&request, &[candidate(9, 0), candidate(3, 5)]).unwrap();
        let second = place(&request, &[candidate(3, 5), candidate(9, 0)]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].server_id, Uuid::from_u128(3));
    }

    #[test]
    fn explicit_rows_pass_through_and_offline_servers_fail_the_request() {
        let online = candidate(1, 0);
        let offline = Uuid::from_u128(2);

        let request = PlacementRequest {
            replicas: 3,
            stateful: false,
            auto_place: false,
            locked_server_id: None,
            explicit: vec![(online.id, 2), (offline, 1)],
        };

        // The offline server's row is dropped, leaving residual demand.
        assert_eq!(place(&request, &[online]), Err(Error::InsufficientCapacity));

        let request = PlacementRequest {
            replicas: 2,
            ..request
        };
        let placements = place(&request, &[online]).unwrap();
        assert_eq!(
            placements,
            vec![Placement {
                server_id: online.id,
                count: 2
            }]
        );
    }
}
