//! End-to-end DAG operations: branching, merge, rebase, cherry-pick, diff,
//! compression, and validator-guarded generation.

use std::sync::Arc;

use tract::llm::ScriptedClient;
use tract::ops::compress::CompressOptions;
use tract::ops::diff::DiffStatus;
use tract::ops::merge::{MergeStatus, MergeStrategy};
use tract::ops::navigate::ResetMode;
use tract::{
    Content, CompressionOutcome, NullTokenCounter, Priority, Resolution, RetentionCriteria,
    Tract, TractConfig, TractError,
};

/// Best-effort logger for debugging test runs; safe to call repeatedly.
fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn tract() -> Tract {
    init_logger();
    Tract::in_memory(TractConfig::default())
        .expect("open tract")
        .with_token_counter(Box::new(NullTokenCounter))
}

#[test]
fn test_fast_forward_merge() {
    let mut t = tract();
    let x = t.commit(Content::user("X")).unwrap();
    t.branch("feature", None).unwrap();
    t.checkout("feature").unwrap();
    let y = t.commit(Content::assistant("Y")).unwrap();
    assert_eq!(y.parent_hash.as_deref(), Some(x.commit_hash.as_str()));

    t.checkout("main").unwrap();
    let outcome = t.merge("feature", MergeStrategy::Auto, None).unwrap();
    assert_eq!(outcome.status, MergeStatus::FastForward);
    assert_eq!(t.head().unwrap().as_deref(), Some(y.commit_hash.as_str()));
    // no merge commit was created
    assert_eq!(t.log(None).unwrap().len(), 2);

    // merging again, or merging an ancestor, is a no-op
    let again = t.merge("feature", MergeStrategy::Auto, None).unwrap();
    assert_eq!(again.status, MergeStatus::UpToDate);
    t.branch("past", Some(&x.commit_hash)).unwrap();
    let ancestor = t.merge("past", MergeStrategy::Auto, None).unwrap();
    assert_eq!(ancestor.status, MergeStatus::UpToDate);
}

#[test]
fn test_merge_branch_into_itself_is_noop() {
    let mut t = tract();
    t.commit(Content::user("X")).unwrap();
    let outcome = t.merge("main", MergeStrategy::Auto, None).unwrap();
    assert_eq!(outcome.status, MergeStatus::UpToDate);
}

/// Divergent edits of the same commit conflict; without a resolver nothing
/// is written.
#[test]
fn test_divergent_edit_conflict_detection() {
    let mut t = tract();
    let x = t.commit(Content::user("X")).unwrap();
    t.branch("a", None).unwrap();
    t.branch("b", None).unwrap();

    t.checkout("a").unwrap();
    t.edit(&x.commit_hash, Content::user("A")).unwrap();
    t.checkout("b").unwrap();
    t.edit(&x.commit_hash, Content::user("B")).unwrap();

    t.checkout("a").unwrap();
    let head_before = t.head().unwrap();
    let outcome = t.merge("b", MergeStrategy::Auto, None).unwrap();
    assert_eq!(outcome.status, MergeStatus::Conflicted);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].target_hash, x.commit_hash);
    assert_eq!(outcome.conflicts[0].ours_text.as_deref(), Some("A"));
    assert_eq!(outcome.conflicts[0].theirs_text.as_deref(), Some("B"));
    assert_eq!(t.head().unwrap(), head_before);
}

/// An edit on one side of a commit the other side's workflow skipped is
/// the second detected conflict kind.
#[test]
fn test_edit_skip_conflict_detection() {
    let mut t = tract();
    let x = t.commit(Content::user("X")).unwrap();
    t.branch("b", None).unwrap();

    // main rewrites X while b moves on and drops it
    t.edit(&x.commit_hash, Content::user("A")).unwrap();
    t.checkout("b").unwrap();
    t.commit(Content::assistant("side note")).unwrap();
    t.annotate(&x.commit_hash, Priority::Skip, None, None).unwrap();

    t.checkout("main").unwrap();
    let outcome = t.merge("b", MergeStrategy::Auto, None).unwrap();
    assert_eq!(outcome.status, MergeStatus::Conflicted);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].kind, tract::llm::ConflictKind::EditSkip);
    assert_eq!(outcome.conflicts[0].target_hash, x.commit_hash);
    assert_eq!(outcome.conflicts[0].ours_text.as_deref(), Some("A"));
}

/// A resolver turns the conflict into an edit carried by the merge; the
/// merge commit has both parents.
#[test]
fn test_semantic_merge_with_resolver() {
    let mut t = tract();
    let x = t.commit(Content::user("X")).unwrap();
    t.branch("a", None).unwrap();
    t.branch("b", None).unwrap();

    t.checkout("a").unwrap();
    t.edit(&x.commit_hash, Content::user("A")).unwrap();
    t.checkout("b").unwrap();
    let b_tip = t.edit(&x.commit_hash, Content::user("B")).unwrap();

    t.checkout("a").unwrap();
    let mut resolver = |_issue: &tract::llm::ResolverIssue| Ok(Resolution::resolved("AB"));
    let outcome = t
        .merge("b", MergeStrategy::Semantic, Some(&mut resolver))
        .unwrap();
    assert_eq!(outcome.status, MergeStatus::Merged);

    let merge_commit = outcome.commit.unwrap();
    let parents = t.parents_of(&merge_commit).unwrap();
    assert_eq!(parents.len(), 2);
    assert!(parents.contains(&b_tip.commit_hash));

    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 1);
    assert_eq!(context.messages[0].content, "AB");
}

#[test]
fn test_semantic_merge_abort_writes_nothing() {
    let mut t = tract();
    let x = t.commit(Content::user("X")).unwrap();
    t.branch("b", None).unwrap();
    t.edit(&x.commit_hash, Content::user("A")).unwrap();
    t.checkout("b").unwrap();
    t.edit(&x.commit_hash, Content::user("B")).unwrap();
    t.checkout("main").unwrap();

    let log_before = t.log(None).unwrap().len();
    let mut resolver =
        |_issue: &tract::llm::ResolverIssue| Ok(Resolution::abort("cannot reconcile"));
    let err = t
        .merge("b", MergeStrategy::Semantic, Some(&mut resolver))
        .unwrap_err();
    assert!(matches!(err, TractError::MergeAborted(_)));
    assert_eq!(t.log(None).unwrap().len(), log_before);
}

/// Rebase replays commits with new hashes; originals stay in history.
#[test]
fn test_rebase_replays_onto_new_base() {
    let mut t = tract();
    t.commit(Content::instruction("SYS")).unwrap();
    t.branch("feature", None).unwrap();

    // main moves ahead
    t.commit(Content::user("main work")).unwrap();
    let main_tip = t.head().unwrap().unwrap();

    // feature diverges
    t.checkout("feature").unwrap();
    let old = t.commit(Content::user("feature work")).unwrap();

    let outcome = t.rebase("main", None).unwrap();
    assert_eq!(outcome.replayed.len(), 1);
    let (old_hash, new_hash) = &outcome.replayed[0];
    assert_eq!(old_hash, &old.commit_hash);
    assert_ne!(old_hash, new_hash);

    // the replayed commit sits on top of main's tip
    assert_eq!(t.parents_of(new_hash).unwrap(), vec![main_tip]);
    // the original is still queryable
    assert!(t.commit_info(old_hash).is_ok());

    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].content, "main work\n\nfeature work");
}

/// Replaying an edit whose target vanishes from the ancestry is refused.
#[test]
fn test_rebase_orphan_edit_aborts() {
    let mut t = tract();
    t.commit(Content::instruction("SYS")).unwrap();
    t.branch("feature", None).unwrap();
    t.commit(Content::user("main work")).unwrap();

    t.checkout("feature").unwrap();
    let local = t.commit(Content::user("local")).unwrap();
    t.edit(&local.commit_hash, Content::user("local v2")).unwrap();
    // skip the edited commit's replay by annotating it away from default,
    // then refuse the resolver so the edit would be orphaned
    let mut resolver = |issue: &tract::llm::ResolverIssue| {
        Ok(match issue {
            tract::llm::ResolverIssue::Rebase(w) if w.commit_hash == local.commit_hash => {
                Resolution::skip()
            }
            _ => Resolution::skip(),
        })
    };
    t.annotate(&local.commit_hash, Priority::Pinned, None, None)
        .unwrap();
    let outcome = t.rebase("main", Some(&mut resolver)).unwrap();
    // both the append and its orphaned edit were dropped
    assert_eq!(outcome.replayed.len(), 0);
    assert_eq!(outcome.skipped.len(), 2);

    // without a resolver the same situation aborts
    let mut t2 = tract();
    t2.commit(Content::instruction("SYS")).unwrap();
    t2.branch("feature", None).unwrap();
    t2.commit(Content::user("main work")).unwrap();
    t2.checkout("feature").unwrap();
    let local2 = t2.commit(Content::user("local")).unwrap();
    t2.edit(&local2.commit_hash, Content::user("local v2")).unwrap();
    t2.annotate(&local2.commit_hash, Priority::Pinned, None, None)
        .unwrap();
    let err = t2.rebase("main", None).unwrap_err();
    assert!(matches!(err, TractError::SemanticSafety { .. }));
}

#[test]
fn test_cherry_pick_append_and_orphan_edit() {
    let mut t = tract();
    t.commit(Content::instruction("SYS")).unwrap();
    t.branch("feature", None).unwrap();
    t.checkout("feature").unwrap();
    let picked = t.commit(Content::user("from feature")).unwrap();
    let local = t.commit(Content::user("only here")).unwrap();
    let edit = t.edit(&local.commit_hash, Content::user("patched")).unwrap();

    t.checkout("main").unwrap();
    let replayed = t.cherry_pick(&picked.commit_hash).unwrap();
    assert_ne!(replayed.commit_hash, picked.commit_hash);
    assert_eq!(t.compile().unwrap().messages.len(), 2);

    // the edit's target is not an ancestor of main's HEAD
    let err = t.cherry_pick(&edit.commit_hash).unwrap_err();
    assert!(matches!(err, TractError::CherryPick { .. }));
}

#[test]
fn test_diff_insert_and_replace() {
    let mut t = tract();
    let a = t.commit(Content::user("Hi")).unwrap();
    let b = t.commit(Content::assistant("yo")).unwrap();

    // parent-implicit diff of an append: one insertion
    let result = t.diff(None, &b.commit_hash).unwrap();
    assert_eq!(result.added, 1);
    assert_eq!(result.removed, 0);
    assert!(result
        .entries
        .iter()
        .any(|entry| entry.status == DiffStatus::Insert));

    // edit-implicit diff compares against the edit's target
    let edit = t.edit(&a.commit_hash, Content::user("Hi, world!")).unwrap();
    let result = t.diff(None, &edit.commit_hash).unwrap();
    assert_eq!(result.modified, 1);
    let replace = result
        .entries
        .iter()
        .find(|entry| entry.status == DiffStatus::Replace)
        .unwrap();
    assert!(replace.text_diff.as_deref().unwrap().contains("+Hi, world!"));
}

#[test]
fn test_reset_and_checkout_dash() {
    let mut t = tract();
    let first = t.commit(Content::user("one")).unwrap();
    t.commit(Content::user("two")).unwrap();

    t.reset(&first.commit_hash, ResetMode::Soft).unwrap();
    assert_eq!(t.compile().unwrap().commit_count, 1);
    // the pre-reset position survives in ORIG_HEAD
    assert!(t.resolve("ORIG_HEAD").is_ok());

    let err = t.commit_info("zz").unwrap_err();
    assert!(matches!(err, TractError::InvalidArgument(_)));
}

#[test]
fn test_detached_head_refuses_commits() {
    let mut t = tract();
    let first = t.commit(Content::user("one")).unwrap();
    t.commit(Content::user("two")).unwrap();

    t.checkout(&first.commit_hash).unwrap();
    assert!(t.is_detached().unwrap());
    let err = t.commit(Content::user("nope")).unwrap_err();
    assert!(matches!(err, TractError::DetachedHead { .. }));

    // compile still works while detached, from the detached position
    assert_eq!(t.compile().unwrap().commit_count, 1);
    t.checkout("main").unwrap();
    assert!(!t.is_detached().unwrap());
    t.commit(Content::user("fine again")).unwrap();
}

/// Compression with a retention-flagged commit: the first summary misses
/// the figure and is retried with steering; the accepted summary replaces
/// the range while pinned content passes through.
#[test]
fn test_compression_retention_retry_round_trip() {
    let client = Arc::new(ScriptedClient::new([
        "A summary that forgets the number.",
        "They agreed on a $50k budget.",
    ]));
    let mut t = Tract::in_memory(TractConfig::default())
        .unwrap()
        .with_token_counter(Box::new(NullTokenCounter))
        .with_llm_client(client.clone());

    let mut hashes = Vec::new();
    for i in 0..10 {
        let content = if i % 2 == 0 {
            Content::user(format!("turn {i}"))
        } else {
            Content::assistant(format!("turn {i}"))
        };
        hashes.push(t.commit(content).unwrap().commit_hash);
    }
    t.annotate(
        &hashes[4],
        Priority::Important,
        None,
        Some(RetentionCriteria {
            instructions: Some("keep the agreed budget figure".to_string()),
            match_patterns: vec!["$50k".to_string()],
            match_mode: tract::model::MatchMode::Substring,
        }),
    )
    .unwrap();
    t.annotate(&hashes[9], Priority::Pinned, None, None).unwrap();

    let outcome = t
        .compress(CompressOptions {
            from: hashes[0].clone(),
            to: hashes[9].clone(),
            instructions: Some("summarise".to_string()),
            auto_commit: Some(true),
            ..Default::default()
        })
        .unwrap();
    let info = match outcome {
        CompressionOutcome::Committed(info) => info,
        CompressionOutcome::Pending(_) => panic!("expected an auto-commit"),
    };
    assert_eq!(info.content_type, "summary");

    // exactly one retry happened
    assert_eq!(client.requests().len(), 2);
    // the steering message carried the diagnosis
    let retry_request = &client.requests()[1];
    assert!(retry_request.last().unwrap().content.contains("$50k"));

    // compiled output: the pinned turn plus the summary
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[0].content, "turn 9");
    assert!(context.messages[1].content.contains("$50k"));
}

/// Collaborative mode returns a proposal; approval is TOCTOU-guarded.
#[test]
fn test_compression_proposal_and_head_moved() {
    let client = Arc::new(ScriptedClient::new(["short recap", "unused"]));
    let mut t = Tract::in_memory(TractConfig::default())
        .unwrap()
        .with_token_counter(Box::new(NullTokenCounter))
        .with_llm_client(client);

    let first = t.commit(Content::user("alpha")).unwrap();
    let last = t.commit(Content::assistant("beta")).unwrap();

    let outcome = t
        .compress(CompressOptions {
            from: first.commit_hash.clone(),
            to: last.commit_hash.clone(),
            ..Default::default()
        })
        .unwrap();
    let mut pending = match outcome {
        CompressionOutcome::Pending(pending) => pending,
        CompressionOutcome::Committed(_) => panic!("manual mode must propose"),
    };
    assert_eq!(pending.summary(), "short recap");
    pending.edit_summary("short recap, reviewed");

    // HEAD moves between plan and approve
    t.commit(Content::user("gamma")).unwrap();
    let err = t.approve_compression(&pending).unwrap_err();
    assert!(matches!(err, TractError::Compression(_)));
}

/// Validator-guarded generation with purification: the steering exchange is
/// orphaned, the clean reply lands on the original history.
#[test]
fn test_generate_validated_purify() {
    let client = Arc::new(ScriptedClient::new([
        "bad draft",
        "final answer",
    ]));
    let mut t = Tract::in_memory(TractConfig::default())
        .unwrap()
        .with_token_counter(Box::new(NullTokenCounter))
        .with_llm_client(client.clone());

    t.commit(Content::user("question?")).unwrap();
    let pre_head = t.head().unwrap().unwrap();

    let info = t
        .generate_validated(
            |text| {
                text.contains("bad")
                    .then(|| "draft quality too low".to_string())
            },
            true,
        )
        .unwrap();

    // two model calls; the second saw the steering message
    assert_eq!(client.requests().len(), 2);
    assert!(
        client.requests()[1]
            .iter()
            .any(|m| m.content.contains("draft quality too low"))
    );

    // the reply sits directly on the pre-retry head
    assert_eq!(info.parent_hash.as_deref(), Some(pre_head.as_str()));
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].content, "final answer");
    // the steering commit is orphaned but still queryable
    let orig = t.resolve("ORIG_HEAD").unwrap();
    assert_ne!(orig, pre_head);
    assert!(t.commit_info(&orig).is_ok());
}

/// A batch scope lands atomically and rolls back as one.
#[test]
fn test_batch_scope_atomicity() {
    let mut t = tract();
    t.batch(|t| {
        t.commit(Content::user("a"))?;
        t.commit(Content::assistant("b"))?;
        Ok(())
    })
    .unwrap();
    assert_eq!(t.log(None).unwrap().len(), 2);

    let result: tract::Result<()> = t.batch(|t| {
        t.commit(Content::user("c"))?;
        Err(TractError::InvalidArgument("boom".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(t.log(None).unwrap().len(), 2);
}
