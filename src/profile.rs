//! Synthetic trial inputs.
//!
//! Each cycle gets one [`Profile`]: a closed set of fields describing an
//! application request (category, budget, region, team size, ...). Profiles
//! are derived from `(seed, cycle index)`, so a resumed run regenerates the
//! exact profile a crashed run would have used for the same cycle.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const CATEGORIES: &[&str] = &[
    "saas",
    "marketplace",
    "fintech",
    "healthtech",
    "edtech",
    "logistics",
    "social",
    "devtools",
];

const REGIONS: &[&str] = &["north-america", "europe", "latam", "apac", "africa", "middle-east"];

const PLATFORMS: &[&str] = &["web", "ios", "android", "cross-platform", "desktop"];

const NAME_PREFIXES: &[&str] = &["Nova", "Atlas", "Pulse", "Orbit", "Harbor", "Lumen", "Quill", "Tandem"];

const NAME_SUFFIXES: &[&str] = &["Works", "Hub", "Flow", "Desk", "Link", "Labs", "Base", "Kit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// One synthetic trial's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Cycle index this profile was generated for.
    pub id: u32,
    pub name: String,
    pub category: String,
    pub budget_usd: u32,
    pub region: String,
    pub team_size: u32,
    pub duration_weeks: u32,
    pub complexity: Complexity,
    pub platform: String,
}

/// Deterministic profile source.
#[derive(Debug, Clone)]
pub struct ProfileGenerator {
    seed: u64,
}

impl ProfileGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Draw a fresh seed for runs configured without one.
    pub fn random_seed() -> u64 {
        rand::rng().random()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Profiles for cycles `1..=count`.
    pub fn generate(&self, count: u32) -> Vec<Profile> {
        (1..=count).map(|i| self.profile_for(i)).collect()
    }

    /// The profile for a single cycle index.
    pub fn profile_for(&self, index: u32) -> Profile {
        // splitmix-style mixing so neighbouring indices get unrelated streams
        let mixed = self
            .seed
            .wrapping_add(u64::from(index).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut rng = StdRng::seed_from_u64(mixed);

        let team_size = rng.random_range(1..=25);
        let complexity = match rng.random_range(0..10) {
            0..=3 => Complexity::Low,
            4..=7 => Complexity::Medium,
            _ => Complexity::High,
        };
        let base_budget: u32 = match complexity {
            Complexity::Low => rng.random_range(5..=40),
            Complexity::Medium => rng.random_range(40..=150),
            Complexity::High => rng.random_range(150..=600),
        };

        Profile {
            id: index,
            name: format!(
                "{}{}",
                pick(&mut rng, NAME_PREFIXES),
                pick(&mut rng, NAME_SUFFIXES)
            ),
            category: pick(&mut rng, CATEGORIES).to_string(),
            budget_usd: base_budget * 1000,
            region: pick(&mut rng, REGIONS).to_string(),
            team_size,
            duration_weeks: rng.random_range(2..=52),
            complexity,
            platform: pick(&mut rng, PLATFORMS).to_string(),
        }
    }
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items[rng.random_range(0..items.len())]
}
