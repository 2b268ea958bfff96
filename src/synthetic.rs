/// Synthetic update packets for replay captures, load generation and benches.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EncodeError;
use crate::types::*;
use crate::wire;

/// Shape of the generated stream.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Distinct subjects, drawn once from `subject_range`.
    pub num_subjects: usize,
    pub subject_range: (SubjectId, SubjectId),
    /// Updates per packet, inclusive.
    pub updates_range: (u16, u16),
    /// Real value range before scaling.
    pub value_range: (f64, f64),
    pub volume_range: (u32, u32),
    /// Fixed seed for reproducible captures.
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_subjects: 5,
            subject_range: (10_000, 20_000),
            updates_range: (1, 3),
            value_range: (100.0, 200.0),
            volume_range: (10, 1000),
            seed: None,
        }
    }
}

pub struct PacketGenerator {
    rng: StdRng,
    subjects: Vec<SubjectId>,
    updates: Uniform<u16>,
    values: Uniform<f64>,
    volumes: Uniform<u32>,
    next: usize,
}

impl PacketGenerator {
    pub fn new(config: &SyntheticConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Distinct ids; the range may be narrower than the request.
        let (lo, hi) = config.subject_range;
        let wanted = config.num_subjects.clamp(1, (hi - lo) as usize + 1);
        let mut subjects = Vec::with_capacity(wanted);
        while subjects.len() < wanted {
            let sid = rng.gen_range(lo..=hi);
            if !subjects.contains(&sid) {
                subjects.push(sid);
            }
        }

        Self {
            rng,
            subjects,
            updates: Uniform::new_inclusive(config.updates_range.0, config.updates_range.1),
            values: Uniform::new(config.value_range.0, config.value_range.1),
            volumes: Uniform::new_inclusive(config.volume_range.0, config.volume_range.1),
            next: 0,
        }
    }

    pub fn subjects(&self) -> &[SubjectId] {
        &self.subjects
    }

    /// Next message. Subjects rotate round-robin; update j targets level
    /// j % 10 on a random side.
    pub fn next_message(&mut self) -> UpdateMessage {
        let subject_id = self.subjects[self.next % self.subjects.len()];
        self.next += 1;

        let n = self.updates.sample(&mut self.rng);
        let updates = (0..n)
            .map(|j| LevelUpdate {
                level: (j as usize % MAX_LEVELS) as u8,
                side: if self.rng.gen_bool(0.5) { Side::Supply } else { Side::Demand },
                value: (self.values.sample(&mut self.rng) * SCALE as f64) as i64,
                volume: self.volumes.sample(&mut self.rng),
            })
            .collect();

        UpdateMessage { subject_id, updates }
    }

    /// Next message, wire encoded.
    pub fn next_packet(&mut self) -> Result<Vec<u8>, EncodeError> {
        wire::encode_update(&self.next_message())
    }
}
