use gradeflow_api::services::context_retriever::{
    build_query, format_context, select_chunks, ChunkMatch, ChunkMetadata,
};

fn chunk(similarity: f64, text: &str) -> ChunkMatch {
    ChunkMatch {
        text: text.to_string(),
        similarity,
        metadata: ChunkMetadata {
            title: "Module Notes".to_string(),
            page: None,
            slide: Some(7),
            section: None,
        },
    }
}

#[test]
fn selection_keeps_top_k_above_threshold() {
    let chunks = vec![
        chunk(0.45, "first"),
        chunk(0.91, "second"),
        chunk(0.72, "third"),
        chunk(0.60, "fourth"),
        chunk(0.39, "fifth"),
    ];

    let selected = select_chunks(chunks, 0.4, 3);
    assert_eq!(selected.len(), 3);
    assert_eq!(selected[0].text, "second");
    assert_eq!(selected[1].text, "third");
    assert_eq!(selected[2].text, "fourth");
}

#[test]
fn threshold_can_leave_nothing() {
    let selected = select_chunks(vec![chunk(0.9, "a"), chunk(0.6, "b"), chunk(0.4, "c")], 0.95, 3);
    assert!(selected.is_empty());
}

#[test]
fn threshold_is_inclusive() {
    let selected = select_chunks(vec![chunk(0.4, "edge")], 0.4, 3);
    assert_eq!(selected.len(), 1);
}

#[test]
fn formatted_context_numbers_sources_in_rank_order() {
    let selected = select_chunks(vec![chunk(0.5, "low"), chunk(0.8, "high")], 0.4, 2);
    let formatted = format_context(&selected, true);

    let high_pos = formatted.find("high").unwrap();
    let low_pos = formatted.find("low").unwrap();
    assert!(high_pos < low_pos);
    assert!(formatted.contains("[Source 1] From: Module Notes (Slide 7)"));
    assert!(formatted.contains("[Source 2]"));
}

#[test]
fn query_embeds_both_sides_verbatim() {
    let query = build_query("Define osmosis.", "movement of water across a membrane");
    assert!(query.starts_with("Question: Define osmosis."));
    assert!(query.ends_with("Answer: movement of water across a membrane"));
}
