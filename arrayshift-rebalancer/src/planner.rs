//! Redistribution planner
//!
//! Capacity-constrained bin packing over the discovered disks and allocation
//! units. Produces an ordered move list that:
//! - never fills any disk past its cap (destinations are reserved against
//!   their caps as moves are added, so plans are feasible by construction)
//! - sheds from over-full disks down to the array's equalization goal
//! - keeps a fixed safety reserve free on every destination
//!
//! All orderings use explicit tie-breaks so plans are bit-for-bit
//! reproducible given the same inputs.

use crate::config::CoreConfig;
use arrayshift_core::{format_bytes, AllocationUnit, Disk, Move, Plan, PlanOptions, Strategy};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Planner errors. Fatal to the run.
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Target percent {0} exceeds 100")]
    InvalidTarget(f64),

    #[error("No disks to plan over")]
    NoDisks,
}

pub type Result<T> = std::result::Result<T, PlannerError>;

/// Why a plan is smaller than requested, or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Every disk is already at or below its goal
    Balanced,
    /// A source is still over its cap after exhausting its units
    UnderServed { disk: String, remaining: u64 },
    /// A unit fit no destination and was skipped
    NoFit { unit: AllocationUnit },
}

/// A computed plan plus its diagnostics.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub diagnostics: Vec<Diagnostic>,
}

impl PlanOutcome {
    pub fn is_balanced(&self) -> bool {
        self.diagnostics.contains(&Diagnostic::Balanced)
    }

    pub fn under_served(&self) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::UnderServed { .. }))
            .collect()
    }
}

/// Per-disk capacity bookkeeping during planning.
struct DiskState {
    /// Hard ceiling on post-plan used bytes
    cap: u64,
    /// Equalization goal sources shed down to (<= cap)
    goal: u64,
    /// Used bytes as moves are applied
    used: u64,
    reserve: u64,
    is_source: bool,
}

impl DiskState {
    /// Bytes this disk can still accept: up to its cap, minus the reserve.
    fn acceptance(&self) -> u64 {
        self.cap.saturating_sub(self.used.saturating_add(self.reserve))
    }
}

/// Build a redistribution plan.
#[instrument(skip(config, disks, units))]
pub fn build_plan(
    config: &CoreConfig,
    disks: &[Disk],
    units: &[AllocationUnit],
) -> Result<PlanOutcome> {
    if disks.is_empty() {
        return Err(PlannerError::NoDisks);
    }
    if config.target_percent > 100.0 {
        return Err(PlannerError::InvalidTarget(config.target_percent));
    }

    let reserve = config.reserve_bytes;
    let total_size: u64 = disks.iter().map(|d| d.size_bytes).sum();
    let total_used: u64 = disks.iter().map(|d| d.used_bytes).sum();
    let uniform_fill = if total_size == 0 {
        0.0
    } else {
        total_used as f64 / total_size as f64
    };

    let mut states: HashMap<&str, DiskState> = HashMap::new();
    for d in disks {
        let cap = if config.auto_target() {
            let raw = d.size_bytes as f64 * (uniform_fill + config.headroom_percent / 100.0);
            (raw as u64).min(d.size_bytes.saturating_sub(reserve))
        } else {
            (d.size_bytes as f64 * config.target_percent / 100.0) as u64
        };
        // Sources shed toward the uniform fill, or the cap when the cap is
        // the tighter bound.
        let goal = cap.min((d.size_bytes as f64 * uniform_fill) as u64);
        states.insert(
            d.name.as_str(),
            DiskState {
                cap,
                goal,
                used: d.used_bytes,
                reserve,
                is_source: d.used_bytes > goal,
            },
        );
    }

    let mut sources: Vec<&Disk> = disks
        .iter()
        .filter(|d| states[d.name.as_str()].is_source)
        .collect();

    let mut diagnostics = Vec::new();
    if sources.is_empty() {
        info!("Array is already balanced, nothing to move");
        diagnostics.push(Diagnostic::Balanced);
        return Ok(PlanOutcome {
            plan: empty_plan(config, disks),
            diagnostics,
        });
    }

    match config.strategy {
        // Most-pressured disks shed first.
        Strategy::LowSpaceFirst => {
            sources.sort_by(|a, b| (a.free_bytes, &a.name).cmp(&(b.free_bytes, &b.name)))
        }
        Strategy::Size => sources.sort_by(|a, b| a.name.cmp(&b.name)),
    }

    let mut units_by_disk: HashMap<&str, Vec<&AllocationUnit>> = HashMap::new();
    for u in units {
        units_by_disk.entry(u.src_disk.as_str()).or_default().push(u);
    }
    for list in units_by_disk.values_mut() {
        // Largest first; identity tuple breaks ties.
        list.sort_by(|a, b| {
            (b.size_bytes, &a.share, &a.rel_path).cmp(&(a.size_bytes, &b.share, &b.rel_path))
        });
    }

    let mut moves = Vec::new();
    for source in &sources {
        let mut shed_remaining = {
            let st = &states[source.name.as_str()];
            st.used.saturating_sub(st.goal)
        };
        let candidates = units_by_disk
            .get(source.name.as_str())
            .map(|v| v.as_slice())
            .unwrap_or_default();

        for unit in candidates {
            if shed_remaining == 0 {
                break;
            }
            match place_unit(unit, disks, &mut states) {
                Some(dest) => {
                    debug!(
                        unit = %unit.share_path(),
                        size = %format_bytes(unit.size_bytes),
                        src = %unit.src_disk,
                        dest = %dest,
                        "Planned move"
                    );
                    shed_remaining = shed_remaining.saturating_sub(unit.size_bytes);
                    let src_state = states.get_mut(source.name.as_str()).expect("known disk");
                    src_state.used = src_state.used.saturating_sub(unit.size_bytes);
                    moves.push(Move {
                        unit: (*unit).clone(),
                        dest_disk: dest,
                    });
                }
                None => {
                    warn!(
                        unit = %unit.share_path(),
                        size = %format_bytes(unit.size_bytes),
                        src = %unit.src_disk,
                        "No destination can hold unit, skipping"
                    );
                    diagnostics.push(Diagnostic::NoFit {
                        unit: (*unit).clone(),
                    });
                }
            }
        }

        let st = &states[source.name.as_str()];
        if st.used > st.cap {
            let remaining = st.used - st.cap;
            warn!(
                disk = %source.name,
                remaining = %format_bytes(remaining),
                "Source remains over cap after exhausting units"
            );
            diagnostics.push(Diagnostic::UnderServed {
                disk: source.name.clone(),
                remaining,
            });
        }
    }

    if moves.is_empty() && diagnostics.is_empty() {
        diagnostics.push(Diagnostic::Balanced);
    }

    let plan = Plan {
        disks: disks.to_vec(),
        moves,
        options: plan_options(config),
    };
    info!(summary = %plan.summary(), "Plan created");
    Ok(PlanOutcome { plan, diagnostics })
}

/// Pick the destination with the most remaining acceptance that fits the
/// unit. Source disks never accept; equal-capacity destinations are ordered
/// by name.
fn place_unit(
    unit: &AllocationUnit,
    disks: &[Disk],
    states: &mut HashMap<&str, DiskState>,
) -> Option<String> {
    let mut best: Option<(u64, &str)> = None;
    for d in disks {
        if d.name == unit.src_disk {
            continue;
        }
        let st = &states[d.name.as_str()];
        if st.is_source {
            continue;
        }
        let accept = st.acceptance();
        if accept < unit.size_bytes {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_accept, best_name)) => {
                accept > best_accept || (accept == best_accept && d.name.as_str() < best_name)
            }
        };
        if better {
            best = Some((accept, d.name.as_str()));
        }
    }

    let (_, name) = best?;
    let st = states.get_mut(name).expect("known disk");
    st.used += unit.size_bytes;
    Some(name.to_string())
}

fn plan_options(config: &CoreConfig) -> PlanOptions {
    PlanOptions {
        target_percent: config.target_percent,
        headroom_percent: config.headroom_percent,
        strategy: config.strategy,
        rsync_mode: config.rsync_mode,
        unit_depth: config.unit_depth,
        min_unit_size: config.min_unit_size,
    }
}

fn empty_plan(config: &CoreConfig, disks: &[Disk]) -> Plan {
    Plan {
        disks: disks.to_vec(),
        moves: Vec::new(),
        options: plan_options(config),
    }
}
