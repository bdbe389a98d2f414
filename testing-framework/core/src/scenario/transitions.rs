use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::error::ConfigError;

/// Ordered weighted distribution over next-state names. Weights need not sum
/// to one; they are normalised when a state is chosen.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Distribution {
    entries: Vec<(String, f64)>,
}

impl Distribution {
    #[must_use]
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(state, weight)| (state.into(), weight))
                .collect(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.entries.iter().map(|(_, weight)| weight).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn positive_targets(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, weight)| *weight > 0.0)
            .map(|(state, _)| state.as_str())
    }
}

/// What follows a state once its handler has run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NextStates<'a> {
    /// The state is a declared terminal state; the worker stops.
    Terminal,
    Distribution(&'a Distribution),
}

/// Immutable, validated mapping from state name to its next-state
/// distribution.
#[derive(Clone, Debug)]
pub struct TransitionTable {
    rows: BTreeMap<String, Distribution>,
    terminal: BTreeSet<String>,
}

impl TransitionTable {
    /// Validates the rows against the declared states.
    ///
    /// Rejects undeclared sources and targets, negative or non-finite
    /// weights, duplicate targets within a row, states reachable from
    /// `start` that cannot make progress unless they are declared terminal,
    /// and declared states that can never be reached.
    pub fn new(
        declared: &BTreeSet<String>,
        rows: BTreeMap<String, Distribution>,
        terminal: BTreeSet<String>,
        start: &str,
    ) -> Result<Self, ConfigError> {
        if declared.is_empty() {
            return Err(ConfigError::NoStates);
        }
        if !declared.contains(start) {
            return Err(ConfigError::MissingStartState {
                state: start.to_owned(),
            });
        }

        for (from, distribution) in &rows {
            validate_row(declared, from, distribution)?;
        }

        for state in &terminal {
            if !declared.contains(state) {
                return Err(ConfigError::UndeclaredTerminal {
                    state: state.clone(),
                });
            }
            let has_exits = rows
                .get(state)
                .is_some_and(|row| row.positive_targets().next().is_some());
            if has_exits {
                return Err(ConfigError::TerminalWithTransitions {
                    state: state.clone(),
                });
            }
        }

        let table = Self { rows, terminal };
        let reachable = table.reachable_from(start)?;

        if let Some(unreachable) = declared.iter().find(|state| !reachable.contains(*state)) {
            return Err(ConfigError::UnreachableState {
                state: unreachable.clone(),
                start: start.to_owned(),
            });
        }

        Ok(table)
    }

    /// Distribution over the states that may follow `state`.
    pub fn next_state_distribution(&self, state: &str) -> Result<NextStates<'_>, ConfigError> {
        if self.terminal.contains(state) {
            return Ok(NextStates::Terminal);
        }
        self.rows
            .get(state)
            .map(NextStates::Distribution)
            .ok_or_else(|| ConfigError::MissingTransitions {
                state: state.to_owned(),
            })
    }

    /// Breadth-first walk over positive-weight edges. Every non-terminal
    /// state it visits must be able to make progress.
    fn reachable_from(&self, start: &str) -> Result<HashSet<String>, ConfigError> {
        let mut visited = HashSet::from([start.to_owned()]);
        let mut queue = VecDeque::from([start.to_owned()]);

        while let Some(state) = queue.pop_front() {
            if self.terminal.contains(&state) {
                continue;
            }
            let row = self
                .rows
                .get(&state)
                .ok_or_else(|| ConfigError::MissingTransitions {
                    state: state.clone(),
                })?;
            if row.total_weight() <= 0.0 {
                return Err(ConfigError::NoOutgoingWeight { state });
            }
            for next in row.positive_targets() {
                if visited.insert(next.to_owned()) {
                    queue.push_back(next.to_owned());
                }
            }
        }

        Ok(visited)
    }
}

fn validate_row(
    declared: &BTreeSet<String>,
    from: &str,
    distribution: &Distribution,
) -> Result<(), ConfigError> {
    if !declared.contains(from) {
        return Err(ConfigError::UndeclaredSource {
            state: from.to_owned(),
        });
    }

    let mut seen = HashSet::new();
    for (to, weight) in distribution.entries() {
        if !declared.contains(to) {
            return Err(ConfigError::UndeclaredTarget {
                from: from.to_owned(),
                to: to.clone(),
            });
        }
        if !weight.is_finite() || *weight < 0.0 {
            return Err(ConfigError::InvalidWeight {
                from: from.to_owned(),
                to: to.clone(),
                weight: *weight,
            });
        }
        if !seen.insert(to.as_str()) {
            return Err(ConfigError::DuplicateTarget {
                from: from.to_owned(),
                to: to.clone(),
            });
        }
    }

    if !distribution.total_weight().is_finite() {
        return Err(ConfigError::InvalidWeight {
            from: from.to_owned(),
            to: "*".to_owned(),
            weight: distribution.total_weight(),
        });
    }

    Ok(())
}
