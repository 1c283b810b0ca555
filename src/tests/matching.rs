use super::support::*;
use crate::{
    ids::ItemId,
    matching::{Match, MatchError, SimilarityMatcher},
};

fn ids(matches: &[Match]) -> Vec<&str> {
    matches.iter().map(|m| m.item_id.as_str()).collect()
}

#[test]
fn test_identical_and_orthogonal_neighbours() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "a", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "b", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "c", vec![0.0, 1.0], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, None);
    let matches = matcher.find_matches(&ItemId::from("a"), Some(2)).unwrap();

    assert_eq!(
        matches,
        vec![
            Match {
                item_id: "b".into(),
                similarity: 1.0
            },
            Match {
                item_id: "c".into(),
                similarity: 0.0
            },
        ]
    );
}

#[test]
fn test_source_is_never_its_own_match() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "a", vec![0.5, 0.5], TEST_MODEL);
    insert_with_vector(&store, "b", vec![0.4, 0.6], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, None);
    let matches = matcher.find_matches(&ItemId::from("a"), Some(10)).unwrap();

    assert_eq!(ids(&matches), vec!["b"]);
}

#[test]
fn test_ties_ordered_by_id() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "src", vec![1.0, 1.0], TEST_MODEL);
    for id in ["d", "b", "c"] {
        insert_with_vector(&store, id, vec![2.0, 2.0], TEST_MODEL);
    }
    insert_with_vector(&store, "a", vec![1.0, 0.0], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, None);
    let first = matcher.find_matches(&ItemId::from("src"), None).unwrap();
    let second = matcher.find_matches(&ItemId::from("src"), None).unwrap();

    assert_eq!(ids(&first), vec!["b", "c", "d", "a"]);
    assert_eq!(first, second);
}

#[test]
fn test_sorted_descending_and_truncated() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "src", vec![1.0, 0.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "far", vec![-1.0, 0.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "mid", vec![1.0, 1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "near", vec![1.0, 0.1, 0.0], TEST_MODEL);
    insert_with_vector(&store, "side", vec![0.0, 0.0, 1.0], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, None);
    let matches = matcher.find_matches(&ItemId::from("src"), Some(3)).unwrap();

    assert_eq!(ids(&matches), vec!["near", "mid", "side"]);
    assert!(matches.windows(2).all(|w| w[0].similarity >= w[1].similarity));
}

#[test]
fn test_default_k_from_config() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "src", vec![1.0, 0.0], TEST_MODEL);
    for i in 0..8 {
        insert_with_vector(&store, &format!("n{i}"), vec![1.0, i as f32], TEST_MODEL);
    }

    let matcher = SimilarityMatcher::new(store, 5, None);
    assert_eq!(matcher.find_matches(&ItemId::from("src"), None).unwrap().len(), 5);
}

#[test]
fn test_candidates_without_vector_or_other_dimension_skipped() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "src", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "same", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "longer", vec![1.0, 0.0, 0.0], TEST_MODEL);
    add_item(&store, "no vector yet", "still waiting");

    let matcher = SimilarityMatcher::new(store, 5, None);
    let matches = matcher.find_matches(&ItemId::from("src"), None).unwrap();

    assert_eq!(ids(&matches), vec!["same"]);
}

#[test]
fn test_zero_vector_candidate_scores_zero() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "src", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "zero", vec![0.0, 0.0], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, None);
    let matches = matcher.find_matches(&ItemId::from("src"), None).unwrap();

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].similarity, 0.0);
}

#[test]
fn test_min_similarity_filters() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "src", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "close", vec![1.0, 0.1], TEST_MODEL);
    insert_with_vector(&store, "opposite", vec![-1.0, 0.0], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, Some(0.5));
    let matches = matcher.find_matches(&ItemId::from("src"), None).unwrap();

    assert_eq!(ids(&matches), vec!["close"]);
}

#[test]
fn test_errors() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "a", vec![1.0, 0.0], TEST_MODEL);
    let pending = add_item(&store, "", "not embedded yet");

    let matcher = SimilarityMatcher::new(store, 5, None);

    assert!(matches!(
        matcher.find_matches(&ItemId::from("missing"), None),
        Err(MatchError::NotFound(_))
    ));
    assert!(matches!(
        matcher.find_matches(&pending.id, None),
        Err(MatchError::NoVector(_))
    ));
    assert!(matches!(
        matcher.find_matches(&ItemId::from("a"), Some(0)),
        Err(MatchError::InvalidK)
    ));
}

#[test]
fn test_lone_item_has_no_matches() {
    let (store, _tmp) = create_store();
    insert_with_vector(&store, "a", vec![1.0, 0.0], TEST_MODEL);

    let matcher = SimilarityMatcher::new(store, 5, None);
    assert!(matcher.find_matches(&ItemId::from("a"), None).unwrap().is_empty());
}
