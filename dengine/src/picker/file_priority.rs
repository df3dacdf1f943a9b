use crate::torrent::info::Info;

/// Per-file download priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePriority {
    Normal,
    Skip,
}

/// What the priorities of the overlapped files mean for one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceClass {
    /// Overlaps only normal files; requested and served.
    Wanted,
    /// Overlaps only skipped files; neither requested nor served.
    Blacklisted,
    /// Overlaps at least one skipped and one normal file; requested to
    /// complete the wanted neighbors, completed bytes may land in `.parts`.
    Boundary,
}

/// Classifies every piece by the priorities of the file ranges it overlaps.
///
/// `priorities` runs parallel to `info.files`. The sweep is linear in pieces
/// plus files and reruns on any priority change.
pub fn classify_pieces(info: &Info, priorities: &[FilePriority]) -> Vec<PieceClass> {
    let piece_count = info.total_pieces() as usize;
    let mut classes = Vec::with_capacity(piece_count);

    let mut file_index = 0;
    for piece in 0..piece_count {
        let piece_start = piece as u64 * info.piece_length as u64;
        let piece_end = (piece_start + info.piece_size(piece as u32) as u64).min(info.total_length);

        // files are offset-ordered; skip ones that ended before this piece
        while file_index < info.files.len() {
            let file = &info.files[file_index];
            if file.offset + file.length <= piece_start && file.length > 0 {
                file_index += 1;
            } else if file.length == 0 {
                file_index += 1;
            } else {
                break;
            }
        }

        let mut overlaps_normal = false;
        let mut overlaps_skipped = false;
        let mut cursor = file_index;
        while cursor < info.files.len() {
            let file = &info.files[cursor];
            if file.offset >= piece_end {
                break;
            }
            if file.length > 0 {
                match priorities.get(cursor).copied().unwrap_or(FilePriority::Normal) {
                    FilePriority::Normal => overlaps_normal = true,
                    FilePriority::Skip => overlaps_skipped = true,
                }
            }
            cursor += 1;
        }

        classes.push(match (overlaps_normal, overlaps_skipped) {
            (true, false) => PieceClass::Wanted,
            (false, true) => PieceClass::Blacklisted,
            (true, true) => PieceClass::Boundary,
            // zero-length tail piece cannot happen, but stay conservative
            (false, false) => PieceClass::Wanted,
        });
    }

    classes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::FileEntry;

    #[test]
    fn test_all_normal_is_all_wanted() {
        let info = two_file_info();
        let classes = classify_pieces(&info, &[FilePriority::Normal, FilePriority::Normal]);
        assert!(classes.iter().all(|c| *c == PieceClass::Wanted));
        assert_eq!(classes.len(), 7);
    }

    #[test]
    fn test_skip_first_file_marks_boundary() {
        // 50000 + 50000 bytes, pieces of 16384: file A covers pieces 0..3
        // fully and part of piece 3 (49152..65536 crosses the 50000 boundary)
        let info = two_file_info();
        let classes = classify_pieces(&info, &[FilePriority::Skip, FilePriority::Normal]);

        assert_eq!(classes[0], PieceClass::Blacklisted);
        assert_eq!(classes[1], PieceClass::Blacklisted);
        assert_eq!(classes[2], PieceClass::Blacklisted);
        assert_eq!(classes[3], PieceClass::Boundary);
        assert_eq!(classes[4], PieceClass::Wanted);
        assert_eq!(classes[5], PieceClass::Wanted);
        assert_eq!(classes[6], PieceClass::Wanted);
    }

    #[test]
    fn test_skip_second_file() {
        let info = two_file_info();
        let classes = classify_pieces(&info, &[FilePriority::Normal, FilePriority::Skip]);

        assert_eq!(classes[2], PieceClass::Wanted);
        assert_eq!(classes[3], PieceClass::Boundary);
        assert_eq!(classes[4], PieceClass::Blacklisted);
        assert_eq!(classes[6], PieceClass::Blacklisted);
    }

    #[test]
    fn test_skip_everything() {
        let info = two_file_info();
        let classes = classify_pieces(&info, &[FilePriority::Skip, FilePriority::Skip]);
        assert!(classes.iter().all(|c| *c == PieceClass::Blacklisted));
    }

    #[test]
    fn test_reclassify_back_to_wanted() {
        let info = two_file_info();
        let skipped = classify_pieces(&info, &[FilePriority::Skip, FilePriority::Normal]);
        assert_eq!(skipped[0], PieceClass::Blacklisted);

        let restored = classify_pieces(&info, &[FilePriority::Normal, FilePriority::Normal]);
        assert!(restored.iter().all(|c| *c == PieceClass::Wanted));
    }

    #[test]
    fn test_zero_length_file_does_not_blacklist() {
        let info = Info {
            name: "with-empty".to_string(),
            piece_length: 16,
            pieces: vec![0; 20],
            files: vec![
                FileEntry {
                    path: vec!["data".to_string()],
                    length: 16,
                    offset: 0,
                },
                FileEntry {
                    path: vec!["empty".to_string()],
                    length: 0,
                    offset: 16,
                },
            ],
            total_length: 16,
        };
        let classes = classify_pieces(&info, &[FilePriority::Normal, FilePriority::Skip]);
        assert_eq!(classes, vec![PieceClass::Wanted]);
    }

    // Auxiliary functions

    fn two_file_info() -> Info {
        Info {
            name: "pair".to_string(),
            piece_length: 16384,
            pieces: vec![0; 7 * 20],
            files: vec![
                FileEntry {
                    path: vec!["a.bin".to_string()],
                    length: 50_000,
                    offset: 0,
                },
                FileEntry {
                    path: vec!["b.bin".to_string()],
                    length: 50_000,
                    offset: 50_000,
                },
            ],
            total_length: 100_000,
        }
    }
}
