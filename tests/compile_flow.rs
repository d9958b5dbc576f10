//! End-to-end write/read pipeline: append, edit, annotate, cache, cutoffs.

use tract::engine::compile::CompileOptions;
use tract::{
    ChatMessage, Content, DialogueRole, NullTokenCounter, Priority, Tract, TractConfig,
    TractError, TokenCounter,
};

/// Deterministic counter for token arithmetic assertions.
struct CharCounter;

impl TokenCounter for CharCounter {
    fn count_text(&self, text: &str) -> u64 {
        text.chars().count() as u64
    }

    fn source(&self) -> &'static str {
        "chars"
    }
}

fn tract() -> Tract {
    Tract::in_memory(TractConfig::default())
        .expect("open tract")
        .with_token_counter(Box::new(NullTokenCounter))
}

/// Append three turns and read them back in order with their roles.
#[test]
fn test_append_compile_round_trip() {
    let mut t = tract();
    t.commit(Content::instruction("SYS")).unwrap();
    t.commit(Content::user("hi")).unwrap();
    t.commit(Content::assistant("hello")).unwrap();

    let context = t.compile().unwrap();
    assert_eq!(context.commit_count, 3);
    let dicts = context.to_dicts();
    assert_eq!(dicts[0]["role"], "system");
    assert_eq!(dicts[0]["content"], "SYS");
    assert_eq!(dicts[1]["role"], "user");
    assert_eq!(dicts[1]["content"], "hi");
    assert_eq!(dicts[2]["role"], "assistant");
    assert_eq!(dicts[2]["content"], "hello");
}

#[test]
fn test_empty_tract_compiles_to_nothing() {
    let mut t = tract();
    let context = t.compile().unwrap();
    assert!(context.messages.is_empty());
    assert_eq!(context.token_count, 0);
    assert_eq!(context.commit_count, 0);
}

/// Single commit: one message, role per the type's hint, framing overhead
/// included in the count.
#[test]
fn test_single_commit_token_framing() {
    let mut t = Tract::in_memory(TractConfig::default())
        .unwrap()
        .with_token_counter(Box::new(CharCounter));
    t.commit(Content::user("abcd")).unwrap();
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 1);
    // 3 per-message + 4 content + 3 reply primer
    assert_eq!(context.token_count, 10);
    assert_eq!(context.token_source, "chars");
}

/// The latest edit of a target wins; edits never show up as messages.
#[test]
fn test_edit_substitution_latest_wins() {
    let mut t = tract();
    let a = t.commit(Content::user("Hi")).unwrap();

    t.edit(&a.commit_hash, Content::user("Hi, world!")).unwrap();
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 1);
    assert_eq!(context.messages[0].content, "Hi, world!");

    t.edit(&a.commit_hash, Content::user("Hi, world?")).unwrap();
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 1);
    assert_eq!(context.messages[0].content, "Hi, world?");
    assert_eq!(context.commit_count, 1);
}

/// Skip hides a commit; re-annotating NORMAL brings it back.
#[test]
fn test_skip_annotation_round_trip() {
    let mut t = tract();
    t.commit(Content::user("one")).unwrap();
    let middle = t.commit(Content::assistant("two")).unwrap();
    t.commit(Content::user("three")).unwrap();

    assert_eq!(t.compile().unwrap().messages.len(), 3);

    t.annotate(&middle.commit_hash, Priority::Skip, None, None)
        .unwrap();
    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].content, "three");

    t.annotate(&middle.commit_hash, Priority::Normal, None, None)
        .unwrap();
    assert_eq!(t.compile().unwrap().messages.len(), 3);
}

/// Adjacent same-role turns collapse into one message joined by a blank
/// line, taking the name from the first of the run.
#[test]
fn test_same_role_aggregation() {
    let mut t = tract();
    let named = Content::Dialogue {
        role: DialogueRole::User,
        text: "first".to_string(),
        name: Some("ana".to_string()),
    };
    t.commit(named).unwrap();
    t.commit(Content::user("second")).unwrap();
    t.commit(Content::assistant("reply")).unwrap();

    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[0].content, "first\n\nsecond");
    assert_eq!(context.messages[0].name.as_deref(), Some("ana"));
    assert_eq!(context.commit_count, 3);
    for pair in context.messages.windows(2) {
        assert_ne!(pair[0].role, pair[1].role);
    }
}

/// Warm (extended) and cold compiles must agree, including token math.
#[test]
fn test_cache_extension_matches_cold_compile() {
    let mut t = Tract::in_memory(TractConfig::default())
        .unwrap()
        .with_token_counter(Box::new(CharCounter));
    t.commit(Content::user("ab")).unwrap();
    t.compile().unwrap(); // prime the cache
    t.commit(Content::user("cd")).unwrap(); // same-role extension
    t.commit(Content::assistant("ef")).unwrap(); // distinct-role extension
    let warm = t.compile().unwrap();

    // cold: drop all snapshots and recompile from storage
    t.annotate(
        &warm.commit_hashes[0].clone(),
        Priority::Normal,
        None,
        None,
    )
    .unwrap();
    let cold = t.compile().unwrap();
    assert_eq!(warm, cold);
}

#[test]
fn test_compile_idempotent() {
    let mut t = tract();
    t.commit(Content::instruction("SYS")).unwrap();
    t.commit(Content::user("q")).unwrap();
    let first = t.compile().unwrap();
    let second = t.compile().unwrap();
    assert_eq!(first, second);
}

/// `up_to` truncates compiled history; `as_of` and `up_to` are exclusive.
#[test]
fn test_compile_cutoffs() {
    let mut t = tract();
    let first = t.commit(Content::user("early")).unwrap();
    t.commit(Content::assistant("late")).unwrap();

    let truncated = t
        .compile_with(CompileOptions {
            up_to: Some(first.commit_hash.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(truncated.messages.len(), 1);
    assert_eq!(truncated.messages[0].content, "early");

    let as_of = t
        .compile_with(CompileOptions {
            as_of: Some(first.created_at),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(as_of.messages.len(), 1);

    let err = t
        .compile_with(CompileOptions {
            as_of: Some(first.created_at),
            up_to: Some(first.commit_hash),
            include_edit_annotations: false,
        })
        .unwrap_err();
    assert!(matches!(err, TractError::InvalidArgument(_)));
}

#[test]
fn test_edit_marker_option() {
    let mut t = tract();
    let a = t.commit(Content::user("raw")).unwrap();
    t.edit(&a.commit_hash, Content::user("fixed")).unwrap();
    let context = t
        .compile_with(CompileOptions {
            include_edit_annotations: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(context.messages[0].content, "fixed [edited]");
}

/// Tool schemas ride on compiled output as provenance, not messages.
#[test]
fn test_tools_surface_separately() {
    let mut t = tract();
    let schema = serde_json::json!({
        "name": "search",
        "parameters": {"type": "object", "properties": {"q": {"type": "string"}}}
    });
    t.set_active_tools(Some(vec![schema.clone()]));
    t.commit(Content::user("find docs")).unwrap();
    t.set_active_tools(None);
    t.commit(Content::assistant("done")).unwrap();

    let context = t.compile().unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.tools.len(), 1);
    assert_eq!(context.tools[0].name, "search");
    let params = context.to_openai_params();
    assert_eq!(params["tools"][0], schema);
    // the anthropic shape extracts no system here, carries the tools too
    assert_eq!(context.to_anthropic_params()["tools"][0], schema);
}

/// Registry types shadow built-ins and compile through the structural
/// text probe.
#[test]
fn test_custom_content_type_compiles() {
    use tract::content::{ContentHints, CustomContentType};
    let mut t = tract();
    let mut hints = ContentHints::default();
    hints.default_role = "system".to_string();
    t.register_content_type(CustomContentType::new("metric", hints));

    t.commit_raw(serde_json::json!({"type": "metric", "text": "p95=12ms"}))
        .unwrap();
    let context = t.compile().unwrap();
    assert_eq!(context.messages[0].role, "system");
    assert_eq!(context.messages[0].content, "p95=12ms");

    // unknown discriminators without registration are rejected
    let err = t
        .commit_raw(serde_json::json!({"type": "mystery", "x": 1}))
        .unwrap_err();
    assert!(matches!(err, TractError::ContentValidation { .. }));
}

/// A rejected commit leaves no trace: HEAD, history, and annotations are
/// untouched.
#[test]
fn test_failed_commit_rolls_back() {
    let mut t = Tract::in_memory(TractConfig {
        token_budget: Some(10),
        budget_policy: tract::BudgetPolicy::Reject,
        ..Default::default()
    })
    .unwrap()
    .with_token_counter(Box::new(CharCounter));

    let first = t.commit(Content::user("abc")).unwrap();
    let err = t
        .commit(Content::user("a much longer message")) // 21 chars
        .unwrap_err();
    assert!(matches!(err, TractError::BudgetExceeded { .. }));
    assert_eq!(t.head().unwrap().as_deref(), Some(first.commit_hash.as_str()));
    assert_eq!(t.log(None).unwrap().len(), 1);
}

#[test]
fn test_commit_info_round_trips_from_storage() {
    let mut t = tract();
    let returned = t
        .commit_with(
            Content::user("hello"),
            tract::CommitOptions {
                message: Some("first turn".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let reread = t.commit_info(&returned.commit_hash).unwrap();
    assert_eq!(returned, reread);
}

/// Message counting matches the documented per-message overhead.
#[test]
fn test_count_messages_contract() {
    let counter = CharCounter;
    let messages = vec![
        ChatMessage::new("system", "abc"),
        ChatMessage::new("user", "de").with_name("f"),
    ];
    // (3+3) + (3+2+1) + 3
    assert_eq!(counter.count_messages(&messages), 15);
}
