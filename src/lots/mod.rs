pub mod engine;
pub mod types;
pub mod wash;

pub use engine::rebuild_tax_lots_for_taxpayer;
pub use types::*;
pub use wash::{wash_risk_for_loss_sale, WASH_WINDOW_DAYS};
