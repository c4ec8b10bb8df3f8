//! Query command implementation
//!
//! Scope-filtered retrieval with a relevance gate. Every outcome that is not
//! an infrastructure failure comes back as a well-formed [`QueryResponse`];
//! an empty `sections` list plus a `note` means there was not enough
//! grounded content.

use crate::embed::embed_query;
use crate::error::Result;
use crate::generate::extract_json_object;
use crate::library::Library;
use crate::meta::{Book, Chapter, Chunk, Lesson};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a teaching assistant preparing lesson material. \
Use only the textbook passages you are given. Do not add outside knowledge; if the passages \
do not cover something, leave it out. Reply with a single JSON object.";

/// A scoped question
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub book_id: String,
    pub chapter_id: Option<String>,
    pub lesson_id: Option<String>,
    /// When set, the book must belong to this subject
    pub subject_id: Option<String>,
    /// Free-text intent, e.g. lesson-planning notes
    pub content: String,
    /// Result count; the configured default when unset
    pub k: Option<usize>,
}

/// One generated section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeneratedOutline {
    #[serde(default)]
    sections: Vec<Section>,
}

/// A cited passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub book_id: String,
    pub book_name: String,
    pub chapter_id: Option<String>,
    pub lesson_id: Option<String>,
    pub page: i64,
    pub embedding_index: i64,
    pub distance: f32,
    /// `max(0, 1 - distance)`
    pub confidence: f32,
}

/// The scope level whose filter produced the passages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchedScope {
    Lesson,
    Chapter,
    Book,
}

impl std::fmt::Display for MatchedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchedScope::Lesson => write!(f, "lesson"),
            MatchedScope::Chapter => write!(f, "chapter"),
            MatchedScope::Book => write!(f, "book"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sections: Vec<Section>,
    pub sources: Vec<Source>,
    /// Index positions of the ranked passages
    pub indices: Vec<i64>,
    pub distances: Vec<f32>,
    pub matched_scope: Option<MatchedScope>,
    pub note: Option<String>,
}

impl QueryResponse {
    fn ungrounded(note: String) -> Self {
        info!("Query not grounded: {}", note);
        Self {
            note: Some(note),
            ..Default::default()
        }
    }
}

/// A joined search hit
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    pub distance: f32,
}

/// Validated (book, chapter, lesson) tuple
#[derive(Debug, Clone)]
pub struct Scope {
    pub book_id: String,
    pub chapter_id: Option<String>,
    pub lesson_id: Option<String>,
}

impl Scope {
    /// Filter levels, most specific first
    pub fn levels(&self) -> Vec<MatchedScope> {
        match (&self.chapter_id, &self.lesson_id) {
            (_, Some(_)) => vec![MatchedScope::Lesson, MatchedScope::Chapter, MatchedScope::Book],
            (Some(_), None) => vec![MatchedScope::Chapter, MatchedScope::Book],
            (None, None) => vec![MatchedScope::Book],
        }
    }

    pub fn admits(&self, level: MatchedScope, chunk: &Chunk) -> bool {
        let book = chunk.book_id == self.book_id;
        let chapter = book && chunk.chapter_id == self.chapter_id;
        match level {
            MatchedScope::Book => book,
            MatchedScope::Chapter => chapter,
            MatchedScope::Lesson => chapter && chunk.lesson_id == self.lesson_id,
        }
    }

    /// Keep candidates at the most specific level that admits any, relaxing
    /// one level at a time
    pub fn filter(&self, candidates: Vec<Candidate>) -> (Option<MatchedScope>, Vec<Candidate>) {
        let levels = self.levels();
        for (i, level) in levels.iter().enumerate() {
            let kept: Vec<Candidate> = candidates
                .iter()
                .filter(|c| self.admits(*level, &c.chunk))
                .cloned()
                .collect();
            if !kept.is_empty() {
                return (Some(*level), kept);
            }
            if let Some(next) = levels.get(i + 1) {
                warn!(
                    "No passages matched at {} scope; relaxing to {} scope",
                    level, next
                );
            }
        }
        (None, Vec::new())
    }
}

/// Order by distance minus a bonus for each chapter/lesson tag
pub fn rank_candidates(mut candidates: Vec<Candidate>, tag_bonus: f32) -> Vec<Candidate> {
    let score = |c: &Candidate| {
        let tags = c.chunk.chapter_id.is_some() as u8 + c.chunk.lesson_id.is_some() as u8;
        c.distance - tag_bonus * tags as f32
    };
    candidates.sort_by(|a, b| {
        score(a)
            .partial_cmp(&score(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Answer a scoped question from the indexed passages
pub async fn cmd_query(library: &Library, request: QueryRequest) -> Result<QueryResponse> {
    let config = &library.config().query;
    let k = request.k.unwrap_or(config.default_k).max(1);

    let (book, chapter, lesson) = match resolve_scope(library, &request).await? {
        Ok(entities) => entities,
        Err(note) => return Ok(QueryResponse::ungrounded(note)),
    };
    let scope = Scope {
        book_id: book.book_id.clone(),
        chapter_id: chapter.as_ref().map(|c| c.chapter_id.clone()),
        lesson_id: lesson.as_ref().map(|l| l.lesson_id.clone()),
    };

    let query_text = [
        chapter.as_ref().map(|c| c.title.as_str()),
        lesson.as_ref().map(|l| l.title.as_str()),
        Some(request.content.trim()),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ");
    info!("Querying {} for: {}", book.name, query_text);

    let query_vector = embed_query(library.embedder(), &query_text).await?;

    let view = library.read_view().await;
    let wanted = k
        .saturating_mul(config.oversample)
        .min(library.index().len()?);
    let neighbors = library.index().search(&query_vector, wanted)?;
    debug!("Index returned {} neighbors for k'={}", neighbors.len(), wanted);

    let positions: Vec<i64> = neighbors.iter().map(|n| n.position as i64).collect();
    let chunks = library.db().chunks_by_indices(&positions).await?;
    drop(view);
    if chunks.len() < positions.len() {
        warn!(
            "{} index positions have no stored passage",
            positions.len() - chunks.len()
        );
    }
    let candidates: Vec<Candidate> = chunks
        .into_iter()
        .filter_map(|chunk| {
            neighbors
                .iter()
                .find(|n| n.position as i64 == chunk.embedding_index)
                .map(|n| Candidate {
                    distance: n.distance,
                    chunk,
                })
        })
        .collect();

    let (matched_scope, survivors) = scope.filter(candidates);
    let Some(matched_scope) = matched_scope else {
        return Ok(QueryResponse::ungrounded(
            "Insufficient grounding: no passages found for this book".to_string(),
        ));
    };

    let best = survivors
        .iter()
        .map(|c| c.distance)
        .fold(f32::INFINITY, f32::min);
    if best > config.max_distance {
        return Ok(QueryResponse::ungrounded(format!(
            "Insufficient grounding: best distance {:.3} exceeds threshold {:.3}",
            best, config.max_distance
        )));
    }

    let mut ranked = rank_candidates(survivors, config.tag_bonus);
    ranked.truncate(k);

    let sources = ranked
        .iter()
        .take(config.max_sources)
        .map(|c| Source {
            book_id: c.chunk.book_id.clone(),
            book_name: c.chunk.book_name.clone(),
            chapter_id: c.chunk.chapter_id.clone(),
            lesson_id: c.chunk.lesson_id.clone(),
            page: c.chunk.page,
            embedding_index: c.chunk.embedding_index,
            distance: c.distance,
            confidence: (1.0 - c.distance).max(0.0),
        })
        .collect();

    let prompt = build_prompt(
        &ranked,
        chapter.as_ref(),
        lesson.as_ref(),
        &request.content,
        config.context_passages,
        config.passage_chars,
    );
    let (sections, note) = generate_sections(library, &prompt).await;

    Ok(QueryResponse {
        sections,
        sources,
        indices: ranked.iter().map(|c| c.chunk.embedding_index).collect(),
        distances: ranked.iter().map(|c| c.distance).collect(),
        matched_scope: Some(matched_scope),
        note,
    })
}

type ScopeEntities = (Book, Option<Chapter>, Option<Lesson>);

/// Look up the scope entities. The inner `Err` is a not-found note.
async fn resolve_scope(
    library: &Library,
    request: &QueryRequest,
) -> Result<std::result::Result<ScopeEntities, String>> {
    let db = library.db();

    let Some(book) = db.get_book(&request.book_id).await? else {
        return Ok(Err(format!("Book not found: {}", request.book_id)));
    };

    if let Some(subject) = &request.subject_id {
        if book.subject_id.as_deref() != Some(subject.as_str()) {
            return Ok(Err(format!(
                "Book {} does not belong to subject {}",
                book.book_id, subject
            )));
        }
    }

    let lesson = match &request.lesson_id {
        Some(id) => match db.get_lesson(id).await? {
            Some(lesson) if lesson.book_id == book.book_id => Some(lesson),
            _ => return Ok(Err(format!("Lesson not found in this book: {}", id))),
        },
        None => None,
    };

    // A lesson implies its chapter
    let chapter_id = request
        .chapter_id
        .clone()
        .or_else(|| lesson.as_ref().map(|l| l.chapter_id.clone()));
    let chapter = match &chapter_id {
        Some(id) => match db.get_chapter(id).await? {
            Some(chapter) if chapter.book_id == book.book_id => Some(chapter),
            _ => return Ok(Err(format!("Chapter not found in this book: {}", id))),
        },
        None => None,
    };

    if let (Some(chapter), Some(lesson)) = (&chapter, &lesson) {
        if lesson.chapter_id != chapter.chapter_id {
            return Ok(Err(format!(
                "Lesson {} is not part of chapter {}",
                lesson.lesson_id, chapter.chapter_id
            )));
        }
    }

    Ok(Ok((book, chapter, lesson)))
}

fn build_prompt(
    ranked: &[Candidate],
    chapter: Option<&Chapter>,
    lesson: Option<&Lesson>,
    content: &str,
    passages: usize,
    passage_chars: usize,
) -> String {
    let context = ranked
        .iter()
        .take(passages)
        .map(|c| {
            let excerpt: String = c.chunk.text.chars().take(passage_chars).collect();
            format!(
                "[Source: {}, page {}]\n{}",
                c.chunk.book_name, c.chunk.page, excerpt
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let topic = match (chapter, lesson) {
        (_, Some(lesson)) => format!("the lesson \"{}\"", lesson.title),
        (Some(chapter), None) => format!("the chapter \"{}\"", chapter.title),
        (None, None) => "this book".to_string(),
    };

    format!(
        "Textbook passages:\n\n{context}\n\n\
         Write a lesson outline for {topic} using only the passages above, with 5-10 sections.\n\
         Each section has a title and 3-5 bullet points.\n\
         Add practical examples following these notes: \"{notes}\"\n\
         Format:\n\
         {{\"sections\": [{{\"title\": \"...\", \"bullets\": [\"...\"], \"examples\": [\"...\"]}}]}}",
        context = context,
        topic = topic,
        notes = content.trim(),
    )
}

/// Sections from the generation service, or none plus a note
async fn generate_sections(library: &Library, prompt: &str) -> (Vec<Section>, Option<String>) {
    let Some(generator) = library.generator() else {
        return (
            Vec::new(),
            Some("Generation service not configured; returning sources only".to_string()),
        );
    };

    let reply = match generator.complete(SYSTEM_PROMPT, prompt, 0.0, true).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Answer generation failed: {}", e);
            return (Vec::new(), Some(format!("Generation failed: {}", e)));
        }
    };

    let parsed = extract_json_object(&reply)
        .and_then(|json| serde_json::from_str::<GeneratedOutline>(json).ok());
    match parsed {
        Some(outline) => (outline.sections, None),
        None => {
            warn!("Generation returned malformed JSON");
            (
                Vec::new(),
                Some("Generation returned malformed JSON; returning sources only".to_string()),
            )
        }
    }
}

/// Print a query response to console
pub fn print_query_response(response: &QueryResponse) {
    match response.matched_scope {
        Some(scope) => println!("\n🔍 Matched at {} scope\n", scope),
        None => println!("\n🔍 No grounded match\n"),
    }

    if let Some(note) = &response.note {
        println!("Note: {}\n", note);
    }

    for (i, section) in response.sections.iter().enumerate() {
        println!("{}. {}", i + 1, section.title);
        for bullet in &section.bullets {
            println!("   • {}", bullet);
        }
        for example in &section.examples {
            println!("   e.g. {}", example);
        }
        println!();
    }

    if !response.sources.is_empty() {
        println!("Sources:");
        for source in &response.sources {
            println!(
                "  [confidence: {:.3}] {}, page {} (#{})",
                source.confidence, source.book_name, source.page, source.embedding_index
            );
        }
    }
}
