// Post Store Tests
// Creation, ingestion and listing of posts

use postmesh::identity::NodeId;
use postmesh::post::{feed_order, Post, PostError, PostPolicy, PostStore};
use postmesh::storage::NodeStore;
use tempfile::TempDir;

fn store() -> PostStore {
    PostStore::temporary(NodeId::generate(), PostPolicy::default()).unwrap()
}

fn now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

// ============================================================================
// CREATION
// ============================================================================

#[test]
fn test_create_post_keeps_fields() {
    let store = store();
    let post = store.create("hello", "anon1").unwrap();

    assert_eq!(post.content(), "hello");
    assert_eq!(post.pseudonym(), "anon1");
    assert_eq!(post.origin(), store.origin());
    assert!(post.has_valid_id());
    assert_eq!(store.get_all().unwrap(), vec![post]);
}

#[test]
fn test_same_inputs_give_same_id() {
    let origin = NodeId::generate();
    let a = PostStore::temporary(origin, PostPolicy::default()).unwrap();
    let b = PostStore::temporary(origin, PostPolicy::default()).unwrap();

    let first = a.create_at("hello", "anon1", 1_700_000_000).unwrap();
    let second = b.create_at("hello", "anon1", 1_700_000_000).unwrap();
    assert_eq!(first.id(), second.id());
}

#[test]
fn test_id_depends_on_every_field() {
    let origin = NodeId::generate();
    let base = Post::new("hello", "anon1", 10, origin);

    assert_ne!(base.id(), Post::new("hello!", "anon1", 10, origin).id());
    assert_ne!(base.id(), Post::new("hello", "anon2", 10, origin).id());
    assert_ne!(base.id(), Post::new("hello", "anon1", 11, origin).id());
    assert_ne!(base.id(), Post::new("hello", "anon1", 10, NodeId::generate()).id());
}

#[test]
fn test_invalid_local_posts_are_not_stored() {
    let store = store();

    assert_eq!(store.create("", "anon"), Err(PostError::EmptyContent));
    assert_eq!(store.create("   ", "anon"), Err(PostError::EmptyContent));
    assert!(matches!(
        store.create(&"x".repeat(1001), "anon"),
        Err(PostError::ContentTooLong { len: 1001, max: 1000 })
    ));
    assert!(store.is_empty());
}

#[test]
fn test_content_limit_counts_characters() {
    let store = store();
    assert!(store.create(&"é".repeat(1000), "anon").is_ok());
}

// ============================================================================
// REMOTE INGESTION
// ============================================================================

#[test]
fn test_ingest_is_idempotent() {
    let store = store();
    let post = Post::new("from afar", "remote", now(), NodeId::generate());

    assert!(store.ingest_remote(post.clone()).unwrap());
    let after_first = (store.get_all().unwrap(), store.digest().unwrap());

    assert!(!store.ingest_remote(post).unwrap());
    let after_second = (store.get_all().unwrap(), store.digest().unwrap());
    assert_eq!(after_first, after_second);
}

#[test]
fn test_ingest_rejects_forged_id() {
    let store = store();
    let genuine = Post::new("original", "remote", now(), NodeId::generate());
    let forged = Post::from_parts(genuine.id(), "tampered", "remote", genuine.timestamp(), *genuine.origin());

    let err = store.ingest_remote(forged).unwrap_err();
    assert!(err.is_corruption());
    assert!(store.is_empty());
}

#[test]
fn test_ingest_rejects_far_future_timestamp() {
    let store = store();
    let post = Post::new("from the future", "remote", now() + 3600, NodeId::generate());

    assert!(matches!(
        store.ingest_remote(post),
        Err(PostError::FutureTimestamp { .. })
    ));
}

#[test]
fn test_ingest_accepts_skew_within_tolerance() {
    let store = store();
    let post = Post::new("slightly ahead", "remote", now() + 60, NodeId::generate());
    assert!(store.ingest_remote(post).unwrap());
}

#[test]
fn test_skew_tolerance_is_tunable() {
    let policy = PostPolicy::new().with_max_clock_skew_secs(0);
    let store = PostStore::temporary(NodeId::generate(), policy).unwrap();
    let post = Post::new("ahead", "remote", now() + 60, NodeId::generate());

    assert!(store.ingest_remote(post).is_err());
}

#[test]
fn test_old_posts_are_accepted() {
    let store = store();
    let post = Post::new("ancient", "remote", 1, NodeId::generate());
    assert!(store.ingest_remote(post).unwrap());
}

// ============================================================================
// ORDERING
// ============================================================================

#[test]
fn test_get_posts_ordering_table() {
    let origin = NodeId::generate();
    // (timestamps inserted, expected timestamps in listing order)
    let cases: Vec<(Vec<u64>, Vec<u64>)> = vec![
        (vec![], vec![]),
        (vec![5], vec![5]),
        (vec![1, 2, 3], vec![3, 2, 1]),
        (vec![3, 1, 2], vec![3, 2, 1]),
        (vec![7, 7, 7], vec![7, 7, 7]),
        (vec![2, 9, 2, 9], vec![9, 9, 2, 2]),
    ];

    for (inserted, expected) in cases {
        let store = PostStore::temporary(origin, PostPolicy::default()).unwrap();
        for (i, ts) in inserted.iter().enumerate() {
            store.create_at(&format!("post {}", i), "anon", *ts).unwrap();
        }

        let posts = store.get_all().unwrap();
        let timestamps: Vec<u64> = posts.iter().map(|p| p.timestamp()).collect();
        assert_eq!(timestamps, expected, "inserted {:?}", inserted);

        for pair in posts.windows(2) {
            if pair[0].timestamp() == pair[1].timestamp() {
                assert!(pair[0].id() < pair[1].id(), "ties must be ordered by id");
            }
        }
    }
}

#[test]
fn test_feed_order_matches_listing() {
    let store = store();
    for i in 0..20 {
        store.create_at(&format!("post {}", i), "anon", i % 4).unwrap();
    }

    let listed = store.get_all().unwrap();
    let mut sorted = listed.clone();
    sorted.sort_by(feed_order);
    assert_eq!(listed, sorted);
}

#[test]
fn test_each_listing_is_independent() {
    let store = store();
    store.create("one", "anon").unwrap();

    let mut first = store.get_all().unwrap();
    first.clear();
    assert_eq!(store.get_all().unwrap().len(), 1);
}

// ============================================================================
// RETENTION
// ============================================================================

fn capped(max: usize) -> PostStore {
    PostStore::temporary(NodeId::generate(), PostPolicy::new().with_max_posts(max)).unwrap()
}

#[test]
fn test_cap_prunes_oldest_first() {
    let store = capped(3);
    for ts in [10, 40, 20, 50, 30] {
        store.create_at(&format!("at {}", ts), "anon", ts).unwrap();
    }

    let kept: Vec<u64> = store.get_all().unwrap().iter().map(|p| p.timestamp()).collect();
    assert_eq!(kept, vec![50, 40, 30]);
    assert_eq!(store.len(), 3);
    assert_eq!(store.pruned_count(), 2);
}

#[test]
fn test_pruned_post_is_not_ingested_again() {
    let store = capped(1);
    let old = Post::new("old", "remote", 100, NodeId::generate());
    let new = Post::new("new", "remote", 200, NodeId::generate());

    assert!(store.ingest_remote(old.clone()).unwrap());
    assert!(store.ingest_remote(new.clone()).unwrap());
    assert!(store.is_pruned(&old.id()).unwrap());
    assert!(!store.contains(&old.id()).unwrap());
    assert!(store.knows(&old.id()).unwrap());

    assert!(!store.ingest_remote(old).unwrap());
    assert_eq!(store.get_all().unwrap(), vec![new]);
}

#[test]
fn test_post_older_than_retained_window_is_not_new() {
    let store = capped(2);
    store.create_at("a", "anon", 300).unwrap();
    store.create_at("b", "anon", 400).unwrap();

    let stale = Post::new("stale", "remote", 5, NodeId::generate());
    assert!(!store.ingest_remote(stale.clone()).unwrap());
    assert!(store.is_pruned(&stale.id()).unwrap());
    assert_eq!(store.len(), 2);
}

#[test]
fn test_tombstones_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let origin = NodeId::generate();
    let policy = PostPolicy::new().with_max_posts(1);
    let open = |node_store: &NodeStore| {
        PostStore::new(
            node_store.posts_tree().unwrap(),
            node_store.pruned_tree().unwrap(),
            origin,
            policy.clone(),
        )
    };

    let old = {
        let node_store = NodeStore::open(temp_dir.path()).unwrap();
        let posts = open(&node_store);
        let old = posts.create_at("old", "anon", 1).unwrap();
        posts.create_at("new", "anon", 2).unwrap();
        posts.flush().unwrap();
        old
    };

    let node_store = NodeStore::open(temp_dir.path()).unwrap();
    let posts = open(&node_store);
    assert!(posts.is_pruned(&old.id()).unwrap());
    assert!(!posts.ingest_remote(old).unwrap());
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[test]
fn test_posts_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let origin = NodeId::generate();

    let created = {
        let node_store = NodeStore::open(temp_dir.path()).unwrap();
        let posts = PostStore::new(
            node_store.posts_tree().unwrap(),
            node_store.pruned_tree().unwrap(),
            origin,
            PostPolicy::default(),
        );
        let post = posts.create("durable", "anon").unwrap();
        posts.flush().unwrap();
        post
    };

    let node_store = NodeStore::open(temp_dir.path()).unwrap();
    let posts = PostStore::new(
        node_store.posts_tree().unwrap(),
        node_store.pruned_tree().unwrap(),
        origin,
        PostPolicy::default(),
    );
    assert_eq!(posts.get(&created.id()).unwrap(), Some(created));
}

#[test]
fn test_digest_tracks_contents() {
    let a = store();
    let b = store();
    assert_eq!(a.digest().unwrap(), b.digest().unwrap());

    let post = a.create_at("shared", "anon", 42).unwrap();
    let digest = a.digest().unwrap();
    assert_eq!(digest.count, 1);
    assert_eq!(digest.watermark, 42);
    assert_ne!(digest.root, b.digest().unwrap().root);

    b.ingest_remote(post).unwrap();
    assert_eq!(a.digest().unwrap(), b.digest().unwrap());
}
