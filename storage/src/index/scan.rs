//! Scans over a whole term table that keep at most one path of each tree resident.

use super::{TermEntry, TermTable};
use crate::{address::Address, Error};
use std::collections::HashMap;
use tracing::debug;

/// Root and edition of a page stored as a USK or as the SSK form of a USK edition.
fn usk_edition(page: &Address) -> Option<(Address, i64)> {
    let usk = if page.is_usk() {
        page.clone()
    } else if page.is_ssk_for_usk() {
        page.usk_for_ssk().ok()?
    } else {
        return None;
    };
    Some((usk.root()?, usk.edition()?))
}

/// Returns [TermEntry::DeletePage] tombstones for every page posting superseded by a newer
/// edition of the same site.
///
/// A posting is superseded when its page is a USK (or the SSK of a USK edition) whose edition is
/// lower than the highest edition posted for the same root anywhere in `ttab`. Postings at the
/// highest edition are all kept.
pub fn superseded_editions(ttab: &mut TermTable) -> Result<Vec<TermEntry>, Error> {
    let mut latest: HashMap<Address, i64> = HashMap::new();
    ttab.for_each_auto_deflate(|_, set| {
        set.for_each_auto_deflate(|posting| {
            if let Some((root, edition)) = posting
                .page_entry()
                .and_then(|page| usk_edition(&page.page))
            {
                let seen = latest.entry(root).or_insert(edition);
                *seen = (*seen).max(edition);
            }
            Ok(true)
        })?;
        Ok(true)
    })?;

    let mut superseded = Vec::new();
    if latest.is_empty() {
        return Ok(superseded);
    }
    ttab.for_each_auto_deflate(|_, set| {
        set.for_each_auto_deflate(|posting| {
            let TermEntry::Page(page) = posting else {
                return Ok(true);
            };
            if let Some((root, edition)) = usk_edition(&page.page) {
                if latest.get(&root).is_some_and(|&newest| edition < newest) {
                    superseded.push(posting.clone().into_delete());
                }
            }
            Ok(true)
        })?;
        Ok(true)
    })?;
    debug!(
        roots = latest.len(),
        superseded = superseded.len(),
        "scanned editions"
    );
    Ok(superseded)
}
