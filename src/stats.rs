use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::time::Instant;

/// Accumulated matching counts for one cascade stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageMatchCounts {
    pub num_fg: usize,
    pub num_bg: usize,
}

impl StageMatchCounts {
    pub fn total(&self) -> usize {
        self.num_fg + self.num_bg
    }
}

/// Per-stage foreground/background match statistics of training forwards.
///
/// These are observability signals, not inputs to any computation: the
/// cascade fills one of these per forward pass and a training loop can
/// accumulate and flush them next to its loss curve.
#[derive(Debug, Clone)]
pub struct MatchStats {
    stopwatch: Instant,
    stages: Vec<StageMatchCounts>,
    forwards: usize,
}

impl MatchStats {
    pub fn new(num_stages: usize) -> Self {
        MatchStats {
            stopwatch: Instant::now(),
            stages: vec![StageMatchCounts::default(); num_stages],
            forwards: 0,
        }
    }

    /// Adds one image's match outcome for the given stage.
    pub fn update(&mut self, stage: usize, num_fg: usize, num_bg: usize) {
        let counts = &mut self.stages[stage];
        counts.num_fg += num_fg;
        counts.num_bg += num_bg;
    }

    /// Marks one completed forward pass.
    pub fn bump_forwards(&mut self) {
        self.forwards += 1;
    }

    /// Merges another record, stage by stage.
    pub fn absorb(&mut self, other: &MatchStats) {
        assert_eq!(self.stages.len(), other.stages.len());
        for (mine, theirs) in self.stages.iter_mut().zip(other.stages.iter()) {
            mine.num_fg += theirs.num_fg;
            mine.num_bg += theirs.num_bg;
        }
        self.forwards += other.forwards;
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, stage: usize) -> StageMatchCounts {
        self.stages[stage]
    }

    pub fn summary(&self) -> String {
        let elapsed = self.stopwatch.elapsed().as_secs();

        let per_stage = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| format!("S{}:fg={},bg={}", i, s.num_fg, s.num_bg))
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "F:{:<6} {} T:{}m{}s",
            self.forwards,
            per_stage,
            elapsed / 60,
            elapsed % 60
        )
    }

    /// Appends a timestamped summary line to `path` and resets the
    /// accumulated counts.
    pub fn flush_to(&mut self, path: &str) -> std::io::Result<()> {
        let f_handle = File::options().create(true).append(true).open(path)?;

        writeln!(
            &f_handle,
            "{} {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            self.summary()
        )?;

        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        for counts in self.stages.iter_mut() {
            *counts = StageMatchCounts::default();
        }
        self.forwards = 0;
        self.stopwatch = Instant::now();
    }
}
