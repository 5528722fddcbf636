//! Hides backup slots from directory listings.

use crate::backend::DirEntry;
use crate::version::is_backup_name;

/// Visible entries of `entries` positioned after the cursor `after`.
///
/// Entries keep the backing store's order and offsets, so a caller that
/// resumes from the offset of the last entry it saw never skips or repeats
/// a visible name even though hidden slots sit between them.
pub fn visible_entries(entries: Vec<DirEntry>, after: u64) -> Vec<DirEntry> {
    entries
        .into_iter()
        .filter(|e| e.offset > after && !is_backup_name(&e.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectKind;

    fn listing(names: &[&str]) -> Vec<DirEntry> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| DirEntry {
                name: n.to_string(),
                kind: ObjectKind::File,
                offset: i as u64 + 1,
            })
            .collect()
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_hides_backup_slots() {
        let all = listing(&["a.txt", ".backup.a.txt.1", "b", ".backup.a.txt.2", ".hidden"]);
        let shown = visible_entries(all, 0);
        assert_eq!(names(&shown), vec!["a.txt", "b", ".hidden"]);
        assert_eq!(shown[1].offset, 3);
    }

    #[test]
    fn test_resume_from_cursor() {
        let all = listing(&["a", ".backup.a.1", ".backup.a.2", "b", "c"]);
        let first = visible_entries(all.clone(), 0);
        let resumed = visible_entries(all, first[0].offset);
        assert_eq!(names(&resumed), vec!["b", "c"]);
    }

    #[test]
    fn test_only_slots_yields_nothing() {
        let all = listing(&[".backup.x.1", ".backup.x.2"]);
        assert!(visible_entries(all, 0).is_empty());
    }
}
