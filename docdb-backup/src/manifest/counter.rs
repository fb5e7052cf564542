//! Resource counting for restore progress totals.

use super::reader::{ManifestEvent, ManifestReader};
use crate::utils::errors::Result;
use std::io::BufRead;

/// Count the `resource` elements of one manifest without keeping it in memory.
pub fn count_resources<R: BufRead>(input: R, source: &str) -> Result<usize> {
    let mut count = 0;
    for event in ManifestReader::new(input, source) {
        if let ManifestEvent::Resource(_) = event? {
            count += 1;
        }
    }
    Ok(count)
}
