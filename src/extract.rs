//! Entity and relation extraction for the graph stages.
//!
//! An [`EntityExtractor`] turns one chunk into delimited text records:
//!
//! ```text
//! ("entity"<|>Alice<|>PERSON<|>Engineer at Acme)##
//! ("relationship"<|>Alice<|>Acme<|>Alice works at Acme<|>employment<|>1.0)##
//! <|COMPLETE|>
//! ```
//!
//! [`extract_chunk`] drives the gleaning rounds: the first round asks for
//! everything, later rounds either retry after malformed output or ask the
//! extractor to continue when the completion marker is missing. Records
//! from every parseable round are merged. Parsed results are cached by
//! chunk content hash so identical text is never extracted twice.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ragspace_core::graph::GraphEdge;
use ragspace_core::models::Chunk;
use ragspace_core::store::KvStorage;

use crate::merge::timed;

pub const TUPLE_DELIM: &str = "<|>";
pub const RECORD_DELIM: &str = "##";
pub const COMPLETION_MARKER: &str = "<|COMPLETE|>";

const DEFAULT_MAX_ENTITIES: usize = 32;
const DESCRIPTION_CHARS: usize = 240;

/// Why a given extraction round is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GleaningRound {
    Initial,
    /// The previous round's output could not be parsed.
    Retry,
    /// The previous round parsed but did not end with the completion marker.
    Continue,
}

pub struct ExtractionRequest<'a> {
    pub chunk: &'a Chunk,
    pub round: GleaningRound,
    /// Raw outputs of earlier rounds for this chunk.
    pub history: &'a [String],
    pub model_kwargs: &'a BTreeMap<String, serde_json::Value>,
}

/// Produces delimited extraction records for one chunk.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub weight: f64,
}

/// Everything extracted from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkExtraction {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

impl ChunkExtraction {
    /// Add records not already present. Entities dedupe by name, relations
    /// by unordered endpoint pair; the first occurrence wins.
    fn absorb(&mut self, other: ChunkExtraction) {
        let mut names: BTreeSet<String> = self.entities.iter().map(|e| e.name.clone()).collect();
        for e in other.entities {
            if names.insert(e.name.clone()) {
                self.entities.push(e);
            }
        }
        let mut pairs: BTreeSet<(String, String)> = self
            .relations
            .iter()
            .map(|r| GraphEdge::key(&r.source, &r.target))
            .collect();
        for r in other.relations {
            if pairs.insert(GraphEdge::key(&r.source, &r.target)) {
                self.relations.push(r);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// Result of parsing one round of raw output.
#[derive(Debug, Default)]
pub struct ParsedRound {
    pub records: ChunkExtraction,
    pub complete: bool,
    pub malformed: usize,
}

/// Parse delimited extraction output.
///
/// Output is unusable when it holds malformed records and nothing that
/// parsed; an empty record list with no malformed lines is valid (a chunk
/// may mention no entities).
pub fn parse_extraction(raw: &str) -> Result<ParsedRound> {
    let mut round = ParsedRound::default();
    let mut body = raw.trim();

    if let Some(stripped) = body.strip_suffix(COMPLETION_MARKER) {
        round.complete = true;
        body = stripped;
    }

    for record in body
        .split(RECORD_DELIM)
        .flat_map(|r| r.lines())
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        if record == COMPLETION_MARKER {
            round.complete = true;
            continue;
        }
        match parse_record(record) {
            Some(Record::Entity(e)) => round.records.entities.push(e),
            Some(Record::Relation(r)) => round.records.relations.push(r),
            None => round.malformed += 1,
        }
    }

    if round.malformed > 0 && round.records.is_empty() {
        bail!(
            "extraction output unparseable ({} malformed record(s))",
            round.malformed
        );
    }
    Ok(round)
}

enum Record {
    Entity(ExtractedEntity),
    Relation(ExtractedRelation),
}

fn parse_record(record: &str) -> Option<Record> {
    let inner = record.strip_prefix('(')?.strip_suffix(')')?;
    let fields: Vec<&str> = inner.split(TUPLE_DELIM).map(clean_field).collect();

    match fields.first().copied() {
        Some("entity") if fields.len() == 4 => {
            let name = fields[1];
            if name.is_empty() {
                return None;
            }
            Some(Record::Entity(ExtractedEntity {
                name: name.to_string(),
                entity_type: fields[2].to_uppercase(),
                description: fields[3].to_string(),
            }))
        }
        Some("relationship") if fields.len() == 5 || fields.len() == 6 => {
            let (source, target) = (fields[1], fields[2]);
            if source.is_empty() || target.is_empty() || source == target {
                return None;
            }
            let weight = match fields.get(5) {
                Some(w) => w.parse::<f64>().ok()?,
                None => 1.0,
            };
            Some(Record::Relation(ExtractedRelation {
                source: source.to_string(),
                target: target.to_string(),
                description: fields[3].to_string(),
                keywords: fields[4]
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect(),
                weight,
            }))
        }
        _ => None,
    }
}

fn clean_field(field: &str) -> &str {
    field.trim().trim_matches('"').trim()
}

/// Render records in the delimited format, ending with the completion
/// marker when `complete`.
pub fn format_records(extraction: &ChunkExtraction, complete: bool) -> String {
    let mut records: Vec<String> = Vec::new();
    for e in &extraction.entities {
        records.push(format!(
            "(\"entity\"{d}{}{d}{}{d}{})",
            e.name,
            e.entity_type,
            e.description,
            d = TUPLE_DELIM
        ));
    }
    for r in &extraction.relations {
        records.push(format!(
            "(\"relationship\"{d}{}{d}{}{d}{}{d}{}{d}{})",
            r.source,
            r.target,
            r.description,
            r.keywords.join(","),
            r.weight,
            d = TUPLE_DELIM
        ));
    }
    if complete {
        records.push(COMPLETION_MARKER.to_string());
    }
    records.join(&format!("{}\n", RECORD_DELIM))
}

/// Knobs for [`extract_chunk`].
pub struct ExtractOptions<'a> {
    pub max_gleaning: u32,
    pub model_timeout: Duration,
    /// Limit on each cache read and write.
    pub storage_timeout: Duration,
    pub model_kwargs: &'a BTreeMap<String, serde_json::Value>,
    /// `llm_response_cache` storage, when caching is enabled.
    pub cache: Option<&'a dyn KvStorage>,
}

/// Outcome of extracting one chunk.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub extraction: ChunkExtraction,
    pub rounds: u32,
    pub cache_hit: bool,
}

fn cache_key(chunk: &Chunk) -> String {
    format!("extract:{}", chunk.hash)
}

/// Run gleaning rounds for `chunk`, consulting and filling the cache.
///
/// Fails when no round produced parseable output.
pub async fn extract_chunk(
    extractor: &dyn EntityExtractor,
    chunk: &Chunk,
    opts: &ExtractOptions<'_>,
) -> Result<ChunkOutcome> {
    let key = cache_key(chunk);
    if let Some(cache) = opts.cache {
        let cached = timed(opts.storage_timeout, "cache read", cache.get_by_id(&key)).await?;
        if let Some(hit) = cached {
            if let Ok(extraction) = serde_json::from_value::<ChunkExtraction>(hit) {
                return Ok(ChunkOutcome {
                    extraction,
                    rounds: 0,
                    cache_hit: true,
                });
            }
        }
    }

    let mut merged = ChunkExtraction::default();
    let mut history: Vec<String> = Vec::new();
    let mut round = GleaningRound::Initial;
    let mut parsed_any = false;
    let mut last_err: Option<anyhow::Error> = None;
    let mut rounds = 0;

    for _ in 0..=opts.max_gleaning {
        rounds += 1;
        let request = ExtractionRequest {
            chunk,
            round,
            history: &history,
            model_kwargs: opts.model_kwargs,
        };
        let raw = tokio::time::timeout(opts.model_timeout, extractor.extract(request))
            .await
            .map_err(|_| {
                anyhow!(
                    "extractor '{}' timed out after {:?}",
                    extractor.name(),
                    opts.model_timeout
                )
            })??;

        match parse_extraction(&raw) {
            Ok(parsed) => {
                parsed_any = true;
                merged.absorb(parsed.records);
                if parsed.complete {
                    break;
                }
                round = GleaningRound::Continue;
            }
            Err(e) => {
                tracing::debug!(chunk_id = %chunk.id, error = %e, "malformed extraction output");
                last_err = Some(e);
                round = GleaningRound::Retry;
            }
        }
        history.push(raw);
    }

    if !parsed_any {
        return Err(last_err.unwrap_or_else(|| anyhow!("extraction produced no output")));
    }

    if let Some(cache) = opts.cache {
        let entry = BTreeMap::from([(key, serde_json::to_value(&merged)?)]);
        timed(opts.storage_timeout, "cache write", cache.upsert(entry)).await?;
    }

    Ok(ChunkOutcome {
        extraction: merged,
        rounds,
        cache_hit: false,
    })
}

// ============ Heuristic extractor ============

/// Dependency-free extractor based on capitalization.
///
/// Runs of capitalized words become `CONCEPT` entities described by the
/// first sentence that mentions them; entities appearing in the same
/// sentence are related by co-occurrence. Honors `max_entities` from
/// `model_kwargs`. Everything is found in the first round, so later
/// rounds answer with the completion marker alone.
pub struct HeuristicExtractor;

const SENTENCE_STOPWORDS: &[&str] = &[
    "A", "An", "And", "As", "At", "But", "By", "For", "From", "He", "Her", "His", "I", "If", "In",
    "It", "Its", "Of", "On", "Or", "She", "So", "That", "The", "Their", "There", "These", "They",
    "This", "To", "We", "When", "While", "With", "You",
];

impl HeuristicExtractor {
    fn analyze(text: &str, max_entities: usize) -> ChunkExtraction {
        let mut out = ChunkExtraction::default();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for sentence in sentences(text) {
            let mut in_sentence: Vec<String> = Vec::new();
            for name in capitalized_runs(sentence) {
                if !in_sentence.contains(&name) {
                    in_sentence.push(name.clone());
                }
                if seen.len() < max_entities && seen.insert(name.clone()) {
                    out.entities.push(ExtractedEntity {
                        name,
                        entity_type: "CONCEPT".to_string(),
                        description: truncate(sentence, DESCRIPTION_CHARS),
                    });
                }
            }
            in_sentence.retain(|n| seen.contains(n));
            for pair in in_sentence.windows(2) {
                out.relations.push(ExtractedRelation {
                    source: pair[0].clone(),
                    target: pair[1].clone(),
                    description: truncate(sentence, DESCRIPTION_CHARS),
                    keywords: vec!["co-occurrence".to_string()],
                    weight: 1.0,
                });
            }
        }

        let mut deduped = ChunkExtraction {
            entities: out.entities,
            relations: Vec::new(),
        };
        deduped.absorb(ChunkExtraction {
            entities: Vec::new(),
            relations: out.relations,
        });
        deduped
    }
}

#[async_trait]
impl EntityExtractor for HeuristicExtractor {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<String> {
        if request.round != GleaningRound::Initial {
            return Ok(COMPLETION_MARKER.to_string());
        }
        let max_entities = request
            .model_kwargs
            .get("max_entities")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_ENTITIES);
        let extraction = Self::analyze(&request.chunk.text, max_entities);
        Ok(format_records(&extraction, true))
    }
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn capitalized_runs(sentence: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for (i, word) in sentence.split_whitespace().enumerate() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        let capitalized = word
            .chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false);
        let skip = i == 0 && SENTENCE_STOPWORDS.contains(&word);

        if capitalized && !skip && word.len() > 1 {
            current.push(word);
        } else if !current.is_empty() {
            runs.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        runs.push(current.join(" "));
    }
    runs
}

/// Clip to `max_chars` and strip the record delimiters.
fn truncate(s: &str, max_chars: usize) -> String {
    let clipped: String = s.chars().take(max_chars).collect();
    clipped.replace(RECORD_DELIM, " ").replace(TUPLE_DELIM, " ")
}

/// Build the extractor named by `extraction.provider`.
pub fn create_extractor(provider: &str) -> Result<std::sync::Arc<dyn EntityExtractor>> {
    match provider {
        "heuristic" => Ok(std::sync::Arc::new(HeuristicExtractor)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragspace_core::chunk::chunk_text;
    use ragspace_core::store::memory::MemoryKvStorage;
    use ragspace_core::store::StorageLifecycle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        outputs: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(outputs: &[&str]) -> Self {
            Self {
                outputs: Mutex::new(outputs.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EntityExtractor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn extract(&self, _request: ExtractionRequest<'_>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outputs.lock().unwrap().pop().unwrap_or_default())
        }
    }

    fn chunk(text: &str) -> Chunk {
        chunk_text("doc-x", text, 100).remove(0)
    }

    #[test]
    fn test_parse_entities_and_relations() {
        let raw = r#"("entity"<|>Alice<|>person<|>An engineer)##
("entity"<|>"Acme"<|>ORGANIZATION<|>A company)##
("relationship"<|>Alice<|>Acme<|>works at<|>employment, job<|>2.5)##
<|COMPLETE|>"#;
        let parsed = parse_extraction(raw).unwrap();
        assert!(parsed.complete);
        assert_eq!(parsed.malformed, 0);
        assert_eq!(parsed.records.entities.len(), 2);
        assert_eq!(parsed.records.entities[0].entity_type, "PERSON");
        assert_eq!(parsed.records.entities[1].name, "Acme");
        let rel = &parsed.records.relations[0];
        assert_eq!(rel.keywords, vec!["employment", "job"]);
        assert_eq!(rel.weight, 2.5);
    }

    #[test]
    fn test_parse_tolerates_some_malformed_records() {
        let raw = "(\"entity\"<|>Alice<|>PERSON<|>x)##(\"entity\"<|>broken)";
        let parsed = parse_extraction(raw).unwrap();
        assert_eq!(parsed.malformed, 1);
        assert!(!parsed.complete);
        assert_eq!(parsed.records.entities.len(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_extraction("I could not find anything useful here.").is_err());
        assert!(parse_extraction("<|COMPLETE|>").unwrap().records.is_empty());
    }

    #[test]
    fn test_format_then_parse() {
        let ex = HeuristicExtractor::analyze("Alice met Bob in Paris.", 10);
        let parsed = parse_extraction(&format_records(&ex, true)).unwrap();
        assert_eq!(parsed.records, ex);
    }

    #[test]
    fn test_heuristic_finds_capitalized_runs() {
        let ex = HeuristicExtractor::analyze(
            "The Rust Foundation supports Ferris. Ferris likes New York.",
            10,
        );
        let names: Vec<&str> = ex.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Rust Foundation", "Ferris", "New York"]);
        assert_eq!(ex.relations.len(), 2);
    }

    #[test]
    fn test_heuristic_respects_max_entities() {
        let ex = HeuristicExtractor::analyze("Alpha Beta. Gamma met Delta. Epsilon.", 2);
        assert_eq!(ex.entities.len(), 2);
        assert!(ex.relations.is_empty());
    }

    #[tokio::test]
    async fn test_gleaning_recovers_from_malformed_output() {
        let extractor = Scripted::new(&[
            "sorry, here is some prose",
            "(\"entity\"<|>Alice<|>PERSON<|>engineer)##<|COMPLETE|>",
        ]);
        let kwargs = BTreeMap::new();
        let outcome = extract_chunk(
            &extractor,
            &chunk("Alice writes code."),
            &ExtractOptions {
                max_gleaning: 2,
                model_timeout: Duration::from_secs(5),
                storage_timeout: Duration::from_secs(5),
                model_kwargs: &kwargs,
                cache: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.extraction.entities[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_gleaning_continues_until_complete() {
        let extractor = Scripted::new(&[
            "(\"entity\"<|>Alice<|>PERSON<|>engineer)",
            "(\"entity\"<|>Bob<|>PERSON<|>designer)##(\"entity\"<|>Alice<|>PERSON<|>dup)##<|COMPLETE|>",
            "(\"entity\"<|>Never<|>X<|>unused)",
        ]);
        let kwargs = BTreeMap::new();
        let outcome = extract_chunk(
            &extractor,
            &chunk("Alice and Bob."),
            &ExtractOptions {
                max_gleaning: 5,
                model_timeout: Duration::from_secs(5),
                storage_timeout: Duration::from_secs(5),
                model_kwargs: &kwargs,
                cache: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.rounds, 2);
        let names: Vec<&str> = outcome
            .extraction
            .entities
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
        assert_eq!(outcome.extraction.entities[0].description, "engineer");
    }

    #[tokio::test]
    async fn test_no_parseable_round_fails() {
        let extractor = Scripted::new(&["nope", "still nope"]);
        let kwargs = BTreeMap::new();
        let err = extract_chunk(
            &extractor,
            &chunk("Alice."),
            &ExtractOptions {
                max_gleaning: 1,
                model_timeout: Duration::from_secs(5),
                storage_timeout: Duration::from_secs(5),
                model_kwargs: &kwargs,
                cache: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unparseable"));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_prevents_reextraction() {
        let cache = MemoryKvStorage::new("llm_response_cache");
        cache.initialize().await.unwrap();
        let extractor = Scripted::new(&["(\"entity\"<|>Alice<|>PERSON<|>x)##<|COMPLETE|>"]);
        let kwargs = BTreeMap::new();
        let options = ExtractOptions {
            max_gleaning: 0,
            model_timeout: Duration::from_secs(5),
            storage_timeout: Duration::from_secs(5),
            model_kwargs: &kwargs,
            cache: Some(&cache),
        };

        let first = extract_chunk(&extractor, &chunk("Alice."), &options)
            .await
            .unwrap();
        let second = extract_chunk(&extractor, &chunk("Alice."), &options)
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.extraction, second.extraction);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    /// Cache whose reads never complete.
    struct StalledCache;

    #[async_trait]
    impl StorageLifecycle for StalledCache {
        fn namespace(&self) -> &str {
            "llm_response_cache"
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl KvStorage for StalledCache {
        async fn get_by_id(&self, _id: &str) -> Result<Option<serde_json::Value>> {
            std::future::pending().await
        }

        async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<serde_json::Value>>> {
            Ok(vec![None; ids.len()])
        }

        async fn filter_keys(&self, keys: &[String]) -> Result<std::collections::HashSet<String>> {
            Ok(keys.iter().cloned().collect())
        }

        async fn upsert(&self, _entries: BTreeMap<String, serde_json::Value>) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _ids: &[String]) -> Result<()> {
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_stalled_cache_read_times_out() {
        let extractor = Scripted::new(&["(\"entity\"<|>Alice<|>PERSON<|>x)##<|COMPLETE|>"]);
        let kwargs = BTreeMap::new();
        let options = ExtractOptions {
            max_gleaning: 0,
            model_timeout: Duration::from_secs(5),
            storage_timeout: Duration::from_millis(50),
            model_kwargs: &kwargs,
            cache: Some(&StalledCache),
        };

        let err = extract_chunk(&extractor, &chunk("Alice."), &options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cache read timed out"), "{err}");
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }
}
