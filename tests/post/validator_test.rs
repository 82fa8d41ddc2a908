// Validator Tests
// Input rules for local and remote posts

use postmesh::identity::NodeId;
use postmesh::post::{Post, PostError, PostPolicy, PostValidator, DEFAULT_PSEUDONYM};

const NOW: u64 = 1_700_000_000;

#[test]
fn test_blank_pseudonym_gets_default() {
    let validator = PostValidator::default();
    assert_eq!(validator.validate_local("hi", "").unwrap(), DEFAULT_PSEUDONYM);
}

#[test]
fn test_custom_default_pseudonym() {
    let validator = PostValidator::new(PostPolicy::new().with_default_pseudonym("nobody"));
    assert_eq!(validator.validate_local("hi", " ").unwrap(), "nobody");
}

#[test]
fn test_pseudonym_too_long() {
    let validator = PostValidator::new(PostPolicy::new().with_max_pseudonym_len(4));
    assert!(matches!(
        validator.validate_local("hi", "abcde"),
        Err(PostError::PseudonymTooLong { len: 5, max: 4 })
    ));
}

#[test]
fn test_remote_checks_id_before_content() {
    let validator = PostValidator::default();
    let post = Post::from_parts(
        Post::new("x", "a", NOW, NodeId::generate()).id(),
        "",
        "a",
        NOW,
        NodeId::generate(),
    );

    let err = validator.validate_remote(&post, NOW).unwrap_err();
    assert!(err.is_corruption());
    assert!(!err.is_validation());
}

#[test]
fn test_remote_empty_content_is_validation_error() {
    let validator = PostValidator::default();
    let post = Post::new("  ", "a", NOW, NodeId::generate());

    let err = validator.validate_remote(&post, NOW).unwrap_err();
    assert_eq!(err, PostError::EmptyContent);
    assert!(err.is_validation());
}

#[test]
fn test_remote_skew_boundary() {
    let validator = PostValidator::new(PostPolicy::new().with_max_clock_skew_secs(300));
    let origin = NodeId::generate();

    assert!(validator.validate_remote(&Post::new("a", "b", NOW + 300, origin), NOW).is_ok());
    assert!(validator.validate_remote(&Post::new("a", "b", NOW + 301, origin), NOW).is_err());
}
