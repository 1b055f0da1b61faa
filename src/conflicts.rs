use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Minutes since midnight. Meetings are half-open windows [start, end).
pub type Minute = u16;

#[derive(Debug, Clone)]
pub struct CandidateMeeting {
    /// Set on the update path so a meeting never conflicts with itself.
    pub meeting_id: Option<String>,
    pub section_id: String,
    pub days: Vec<u8>,
    pub start_minute: Minute,
    pub end_minute: Minute,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduledMeeting {
    pub meeting_id: String,
    pub section_id: String,
    pub section_label: String,
    pub days: Vec<u8>,
    pub start_minute: Minute,
    pub end_minute: Minute,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TeacherRef {
    pub staff_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Teacher,
    Room,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub kind: ConflictKind,
    /// Staff id for teacher conflicts, room id for room conflicts.
    pub entity_id: String,
    pub meeting_id: String,
    pub label: String,
    pub window: String,
}

fn overlaps(a_start: Minute, a_end: Minute, b_start: Minute, b_end: Minute) -> bool {
    a_start < b_end && b_start < a_end
}

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn day_name(day: u8) -> &'static str {
    if (1..=7).contains(&day) {
        DAY_NAMES[(day - 1) as usize]
    } else {
        "?"
    }
}

fn format_window(day: u8, start: Minute, end: Minute) -> String {
    format!(
        "{} {:02}:{:02}-{:02}:{:02}",
        day_name(day),
        start / 60,
        start % 60,
        end / 60,
        end % 60
    )
}

/// Scans `existing` for teacher and room collisions with `candidate`.
///
/// Callers supply only active meetings from the candidate's school-year;
/// the scan itself does no filtering beyond day/window/self checks. Pure
/// and side-effect free, so it is safe to run speculatively before commit.
pub fn check_conflicts(
    candidate: &CandidateMeeting,
    existing: &[ScheduledMeeting],
    teachers_by_section: &HashMap<String, Vec<TeacherRef>>,
) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = Vec::new();
    let mut seen: HashSet<(ConflictKind, String, String)> = HashSet::new();

    let empty: Vec<TeacherRef> = Vec::new();
    let candidate_teachers = teachers_by_section
        .get(&candidate.section_id)
        .unwrap_or(&empty);

    for &day in &candidate.days {
        for other in existing {
            if candidate
                .meeting_id
                .as_deref()
                .map(|id| id == other.meeting_id)
                .unwrap_or(false)
            {
                continue;
            }
            if !other.days.contains(&day) {
                continue;
            }
            if !overlaps(
                candidate.start_minute,
                candidate.end_minute,
                other.start_minute,
                other.end_minute,
            ) {
                continue;
            }

            let window = format_window(
                day,
                other.start_minute.max(candidate.start_minute),
                other.end_minute.min(candidate.end_minute),
            );

            let other_teachers = teachers_by_section.get(&other.section_id).unwrap_or(&empty);
            for t in candidate_teachers {
                if !other_teachers.iter().any(|o| o.staff_id == t.staff_id) {
                    continue;
                }
                let key = (
                    ConflictKind::Teacher,
                    t.staff_id.clone(),
                    other.meeting_id.clone(),
                );
                if seen.insert(key) {
                    conflicts.push(Conflict {
                        kind: ConflictKind::Teacher,
                        entity_id: t.staff_id.clone(),
                        meeting_id: other.meeting_id.clone(),
                        label: format!("{} also teaches {}", t.display_name, other.section_label),
                        window: window.clone(),
                    });
                }
            }

            if let (Some(room), Some(other_room)) = (&candidate.room_id, &other.room_id) {
                if room == other_room {
                    let key = (ConflictKind::Room, room.clone(), other.meeting_id.clone());
                    if seen.insert(key) {
                        conflicts.push(Conflict {
                            kind: ConflictKind::Room,
                            entity_id: room.clone(),
                            meeting_id: other.meeting_id.clone(),
                            label: format!("room already booked by {}", other.section_label),
                            window: window.clone(),
                        });
                    }
                }
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(days: &[u8], start: Minute, end: Minute, room: Option<&str>) -> CandidateMeeting {
        CandidateMeeting {
            meeting_id: None,
            section_id: "sec-a".to_string(),
            days: days.to_vec(),
            start_minute: start,
            end_minute: end,
            room_id: room.map(|r| r.to_string()),
        }
    }

    fn meeting(
        id: &str,
        section: &str,
        days: &[u8],
        start: Minute,
        end: Minute,
        room: Option<&str>,
    ) -> ScheduledMeeting {
        ScheduledMeeting {
            meeting_id: id.to_string(),
            section_id: section.to_string(),
            section_label: section.to_uppercase(),
            days: days.to_vec(),
            start_minute: start,
            end_minute: end,
            room_id: room.map(|r| r.to_string()),
        }
    }

    fn shared_teacher() -> HashMap<String, Vec<TeacherRef>> {
        let t = TeacherRef {
            staff_id: "t1".to_string(),
            display_name: "Reyes, Ana".to_string(),
        };
        let mut map = HashMap::new();
        map.insert("sec-a".to_string(), vec![t.clone()]);
        map.insert("sec-b".to_string(), vec![t]);
        map
    }

    #[test]
    fn overlapping_windows_conflict_touching_windows_do_not() {
        let teachers = shared_teacher();
        let existing = vec![meeting("m1", "sec-b", &[1], 600, 660, None)];

        // 10:00-11:00 vs 09:30-10:30 overlaps.
        let hits = check_conflicts(&candidate(&[1], 570, 630, None), &existing, &teachers);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, ConflictKind::Teacher);
        assert_eq!(hits[0].entity_id, "t1");

        // 09:00-10:00 followed by 10:00-11:00 merely touches.
        let hits = check_conflicts(&candidate(&[1], 540, 600, None), &existing, &teachers);
        assert!(hits.is_empty());
    }

    #[test]
    fn shared_weekdays_deduplicate_to_one_conflict() {
        let teachers = shared_teacher();
        let existing = vec![meeting("m1", "sec-b", &[1, 3, 5], 600, 660, None)];
        let hits = check_conflicts(&candidate(&[1, 3, 5], 600, 660, None), &existing, &teachers);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meeting_id, "m1");
    }

    #[test]
    fn no_room_on_candidate_means_no_room_conflicts() {
        let teachers = HashMap::new();
        let existing = vec![meeting("m1", "sec-b", &[2], 480, 540, Some("r9"))];
        let hits = check_conflicts(&candidate(&[2], 480, 540, None), &existing, &teachers);
        assert!(hits.is_empty());
    }

    #[test]
    fn same_room_same_window_is_a_room_conflict() {
        let teachers = HashMap::new();
        let existing = vec![meeting("m1", "sec-b", &[2], 480, 540, Some("r9"))];
        let hits = check_conflicts(&candidate(&[2], 500, 560, Some("r9")), &existing, &teachers);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, ConflictKind::Room);
        assert_eq!(hits[0].entity_id, "r9");
        assert_eq!(hits[0].window, "Tue 08:20-09:00");
    }

    #[test]
    fn update_path_excludes_self() {
        let teachers = shared_teacher();
        let existing = vec![meeting("m1", "sec-a", &[1], 600, 660, Some("r1"))];
        let mut cand = candidate(&[1], 600, 660, Some("r1"));
        cand.meeting_id = Some("m1".to_string());
        let hits = check_conflicts(&cand, &existing, &teachers);
        assert!(hits.is_empty());
    }

    #[test]
    fn empty_day_set_yields_empty_result() {
        let teachers = shared_teacher();
        let existing = vec![meeting("m1", "sec-b", &[1], 600, 660, None)];
        let hits = check_conflicts(&candidate(&[], 600, 660, None), &existing, &teachers);
        assert!(hits.is_empty());
    }

    #[test]
    fn one_entry_per_shared_teacher_per_meeting() {
        let t1 = TeacherRef {
            staff_id: "t1".to_string(),
            display_name: "Reyes, Ana".to_string(),
        };
        let t2 = TeacherRef {
            staff_id: "t2".to_string(),
            display_name: "Cruz, Ben".to_string(),
        };
        let mut teachers = HashMap::new();
        teachers.insert("sec-a".to_string(), vec![t1.clone(), t2.clone()]);
        teachers.insert("sec-b".to_string(), vec![t1, t2]);
        let existing = vec![meeting("m1", "sec-b", &[4], 600, 660, None)];
        let hits = check_conflicts(&candidate(&[4], 610, 650, None), &existing, &teachers);
        assert_eq!(hits.len(), 2);
        let ids: Vec<&str> = hits.iter().map(|c| c.entity_id.as_str()).collect();
        assert!(ids.contains(&"t1") && ids.contains(&"t2"));
    }
}
