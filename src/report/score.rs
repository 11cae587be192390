//! Health score computation.
//!
//! The score is a pure function of the High/Medium/Low finding counts:
//! start at 100, subtract capped per-severity penalties, clamp to [0, 100].
//! Critical and Info findings deliberately do not move the score; Critical
//! issues surface through the severity counts and the summary instead.

/// Per-High penalty and its cap.
const HIGH_WEIGHT: u32 = 10;
const HIGH_CAP: u32 = 50;

/// Per-Medium penalty and its cap.
const MEDIUM_WEIGHT: u32 = 3;
const MEDIUM_CAP: u32 = 30;

/// Per-Low penalty and its cap.
const LOW_WEIGHT: u32 = 1;
const LOW_CAP: u32 = 20;

/// Compute the bounded health score from severity counts.
pub fn health_score(high: usize, medium: usize, low: usize) -> u8 {
    let high_penalty = (HIGH_WEIGHT * high as u32).min(HIGH_CAP);
    let medium_penalty = (MEDIUM_WEIGHT * medium as u32).min(MEDIUM_CAP);
    let low_penalty = (LOW_WEIGHT * low as u32).min(LOW_CAP);

    100u32
        .saturating_sub(high_penalty + medium_penalty + low_penalty)
        .min(100) as u8
}

/// Assessment phrase for a score bracket, used in the report summary.
pub fn assessment_phrase(score: u8) -> &'static str {
    match score {
        90..=100 => "excellent",
        75..=89 => "good",
        50..=74 => "fair",
        25..=49 => "needs improvement",
        _ => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_project_scores_hundred() {
        assert_eq!(health_score(0, 0, 0), 100);
    }

    #[test]
    fn test_individual_weights() {
        assert_eq!(health_score(1, 0, 0), 90);
        assert_eq!(health_score(0, 1, 0), 97);
        assert_eq!(health_score(0, 0, 1), 99);
    }

    #[test]
    fn test_caps_apply() {
        // 20 High findings would be -200 uncapped; the cap holds at -50.
        assert_eq!(health_score(20, 0, 0), 50);
        assert_eq!(health_score(0, 50, 0), 70);
        assert_eq!(health_score(0, 0, 100), 80);
    }

    #[test]
    fn test_floor_is_zero() {
        assert_eq!(health_score(100, 100, 100), 0);
    }

    #[test]
    fn test_purity() {
        for _ in 0..3 {
            assert_eq!(health_score(3, 7, 11), health_score(3, 7, 11));
        }
    }

    #[test]
    fn test_score_always_bounded() {
        for high in [0usize, 1, 5, 50, 1000] {
            for medium in [0usize, 3, 30, 500] {
                for low in [0usize, 2, 20, 200] {
                    let score = health_score(high, medium, low);
                    assert!(score <= 100);
                }
            }
        }
    }

    #[test]
    fn test_assessment_brackets() {
        assert_eq!(assessment_phrase(100), "excellent");
        assert_eq!(assessment_phrase(90), "excellent");
        assert_eq!(assessment_phrase(75), "good");
        assert_eq!(assessment_phrase(50), "fair");
        assert_eq!(assessment_phrase(25), "needs improvement");
        assert_eq!(assessment_phrase(24), "critical");
        assert_eq!(assessment_phrase(0), "critical");
    }
}
