//! Shared table styling for the human-readable (non-`--json`) output path.

use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

#[must_use]
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_content_arrangement(ContentArrangement::Dynamic);
    table
}
