use crate::distribution::Distribution;
use crate::error::ConfigError;
use crate::job::ClassId;

/// Non-negative job counts indexed by `[link][class]`.
///
/// For enabling and inhibiting conditions the links are the transition's
/// input places; for firing outcomes they are its output links.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransitionMatrix {
    counts: Vec<Vec<u32>>,
}

impl TransitionMatrix {
    pub fn zeros(links: usize, classes: usize) -> Self {
        Self {
            counts: vec![vec![0; classes]; links],
        }
    }

    pub fn from_rows(counts: Vec<Vec<u32>>) -> Self {
        Self { counts }
    }

    pub fn with(mut self, link: usize, class: ClassId, count: u32) -> Self {
        self.counts[link][class.0] = count;
        self
    }

    pub fn get(&self, link: usize, class: ClassId) -> u32 {
        self.counts
            .get(link)
            .and_then(|row| row.get(class.0))
            .copied()
            .unwrap_or(0)
    }

    pub fn row(&self, link: usize) -> &[u32] {
        self.counts.get(link).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn links(&self) -> usize {
        self.counts.len()
    }

    pub fn is_zero(&self) -> bool {
        self.counts.iter().flatten().all(|c| *c == 0)
    }

    /// Non-zero entries as `(link, class, count)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, ClassId, u32)> + '_ {
        self.counts.iter().enumerate().flat_map(|(link, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, c)| **c > 0)
                .map(move |(class, c)| (link, ClassId(class), *c))
        })
    }

    /// Sum over links of the counts of `class`.
    pub fn class_total(&self, class: ClassId) -> u32 {
        self.counts.iter().filter_map(|row| row.get(class.0)).sum()
    }

    fn check_shape(&self, context: &str, links: usize, classes: usize) -> Result<(), ConfigError> {
        if self.counts.len() != links {
            return Err(ConfigError::ClassArity {
                context: format!("{context} links"),
                expected: links,
                actual: self.counts.len(),
            });
        }
        match self.counts.iter().find(|row| row.len() != classes) {
            Some(row) => Err(ConfigError::ClassArity {
                context: format!("{context} classes"),
                expected: classes,
                actual: row.len(),
            }),
            None => Ok(()),
        }
    }
}

/// Number of times a mode could fire given `available[place][class]`.
///
/// The degree is the minimum of `floor(available / required)` over every
/// required entry, and zero when any inhibitor threshold is reached.
pub fn enabling_degree(enabling: &TransitionMatrix, inhibiting: &TransitionMatrix, available: &[Vec<u32>]) -> u32 {
    let available_at = |link: usize, class: ClassId| {
        available
            .get(link)
            .and_then(|row| row.get(class.0))
            .copied()
            .unwrap_or(0)
    };
    if inhibiting
        .entries()
        .any(|(link, class, threshold)| available_at(link, class) >= threshold)
    {
        return 0;
    }
    enabling
        .entries()
        .map(|(link, class, required)| available_at(link, class) / required)
        .min()
        .unwrap_or(0)
}

/// One firing mode of a transition.
#[derive(Debug, Clone)]
pub struct ModeSpec {
    pub name: String,
    pub enabling: TransitionMatrix,
    /// Thresholds over input places; zero entries never inhibit.
    pub inhibiting: TransitionMatrix,
    /// Jobs released per output link and class.
    pub firing: TransitionMatrix,
    /// Concurrent timers, `-1` for unbounded.
    pub servers: i64,
    pub delay: Distribution,
}

impl ModeSpec {
    /// A mode with no inhibitors and a single server.
    pub fn new(
        name: impl Into<String>,
        enabling: TransitionMatrix,
        firing: TransitionMatrix,
        delay: Distribution,
    ) -> Self {
        let links = enabling.links();
        let classes = enabling.counts.first().map_or(0, Vec::len);
        Self {
            name: name.into(),
            enabling,
            inhibiting: TransitionMatrix::zeros(links, classes),
            firing,
            servers: 1,
            delay,
        }
    }

    pub fn with_servers(mut self, servers: i64) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_inhibiting(mut self, inhibiting: TransitionMatrix) -> Self {
        self.inhibiting = inhibiting;
        self
    }

    /// Timers the mode may run for a given enabling degree.
    pub fn timer_target(&self, degree: u32) -> usize {
        if self.servers < 0 {
            degree as usize
        } else {
            (degree as usize).min(self.servers as usize)
        }
    }

    /// # Errors
    ///
    /// - `ConfigError::InvalidMode` - If the mode has no enabling condition or
    ///   no servers
    /// - `ConfigError::ClassArity` - If a matrix does not match the links
    /// - `ConfigError::InvalidDistribution` - If the firing delay is invalid
    pub fn validate(
        &self,
        node: &str,
        mode: usize,
        inputs: usize,
        outputs: usize,
        classes: usize,
    ) -> Result<(), ConfigError> {
        if self.enabling.is_zero() {
            return Err(ConfigError::InvalidMode {
                node: node.to_string(),
                mode,
                reason: "mode has no enabling condition".into(),
            });
        }
        if self.servers == 0 || self.servers < -1 {
            return Err(ConfigError::InvalidMode {
                node: node.to_string(),
                mode,
                reason: format!("server count {} must be positive or -1", self.servers),
            });
        }
        let context = |what: &str| format!("{what} of mode {} at {node}", self.name);
        self.enabling.check_shape(&context("enabling"), inputs, classes)?;
        self.inhibiting.check_shape(&context("inhibiting"), inputs, classes)?;
        self.firing.check_shape(&context("firing"), outputs, classes)?;
        self.delay.validate()
    }
}
