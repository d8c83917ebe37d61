use std::sync::atomic::{AtomicBool, Ordering};

use num_bigint::BigUint;
use num_traits::{One, Zero};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Current unit of work handed to miners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub header: String,
    pub seed: String,
    pub height: u64,
}

/// Where jobs come from, plus the upstream health signal
pub trait TemplateSource: Send + Sync {
    fn current_template(&self) -> Option<BlockTemplate>;

    /// `true` while the upstream node is considered unhealthy
    fn is_sick(&self) -> bool;
}

/// In-memory template source fed by whoever polls the upstream node
#[derive(Debug, Default)]
pub struct TemplateBoard {
    current: RwLock<Option<BlockTemplate>>,
    sick: AtomicBool,
}

impl TemplateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current template. Returns `true` if the header changed.
    pub fn publish(&self, template: BlockTemplate) -> bool {
        let mut current = self.current.write();
        let changed = current.as_ref().map(|t| t.header != template.header).unwrap_or(true);
        if changed {
            log::info!("📋 New block template at height {}: {}", template.height, template.header);
        }
        *current = Some(template);
        changed
    }

    pub fn set_sick(&self, sick: bool) {
        let was = self.sick.swap(sick, Ordering::SeqCst);
        if was != sick {
            log::warn!("Upstream health changed: sick={}", sick);
        }
    }
}

impl TemplateSource for TemplateBoard {
    fn current_template(&self) -> Option<BlockTemplate> {
        self.current.read().clone()
    }

    fn is_sick(&self) -> bool {
        self.sick.load(Ordering::SeqCst)
    }
}

/// Share target for a fixed difficulty: `2^256 / difficulty` as 32 hex bytes.
/// Difficulty 1 saturates to the maximum 256-bit value.
pub fn target_hex(difficulty: u64) -> String {
    let pow256 = BigUint::one() << 256u32;
    let max = &pow256 - BigUint::one();
    let target = if difficulty == 0 {
        BigUint::zero()
    } else {
        pow256 / BigUint::from(difficulty)
    };
    format!("0x{:064x}", target.min(max))
}
