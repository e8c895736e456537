//! Ranked full-text lookup over cached tool schemas.
//!
//! Plain BM25 (k1 = 1.2, b = 0.75) over one document per tool: the tool name
//! tokenized on non-alphanumerics and camelCase boundaries, plus its
//! description. Small enough to rebuild whole whenever the cache changes;
//! queries stay well under a millisecond for a few thousand tools.

use crate::protocol::ToolSchema;
use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub server: String,
    pub tool: String,
    pub score: f64,
}

struct Doc {
    server: String,
    tool: String,
    len: u32,
}

pub struct Bm25Index {
    docs: Vec<Doc>,
    /// term -> (doc index, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    avg_len: f64,
}

impl Bm25Index {
    pub fn build<'a, I>(tools: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a ToolSchema)>,
    {
        let mut docs = Vec::new();
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut total_len = 0u64;

        for (server, schema) in tools {
            let mut terms = tokenize(&schema.name);
            if let Some(description) = &schema.description {
                terms.extend(tokenize(description));
            }

            let doc_idx = docs.len();
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for term in &terms {
                *freqs.entry(term.clone()).or_default() += 1;
            }
            for (term, tf) in freqs {
                postings.entry(term).or_default().push((doc_idx, tf));
            }

            total_len += terms.len() as u64;
            docs.push(Doc {
                server: server.to_string(),
                tool: schema.name.clone(),
                len: terms.len() as u32,
            });
        }

        let avg_len = if docs.is_empty() {
            1.0
        } else {
            total_len as f64 / docs.len() as f64
        };

        Self {
            docs,
            postings,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Top `limit` documents by BM25 score, best first. Ties break on server
    /// and tool name so results are stable across runs.
    pub fn query(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let terms = tokenize(query);
        if terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let n = self.docs.len() as f64;
        let mut scores: HashMap<usize, f64> = HashMap::new();

        let mut seen: Vec<&String> = Vec::new();
        for term in &terms {
            if seen.contains(&term) {
                continue;
            }
            seen.push(term);

            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for &(doc_idx, tf) in posting {
                let doc = &self.docs[doc_idx];
                let tf = f64::from(tf);
                let norm = K1 * (1.0 - B + B * f64::from(doc.len) / self.avg_len);
                let contribution = idf * (tf * (K1 + 1.0)) / (tf + norm);
                *scores.entry(doc_idx).or_default() += contribution;
            }
        }

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1).then_with(|| {
                let (da, db) = (&self.docs[a.0], &self.docs[b.0]);
                (&da.server, &da.tool).cmp(&(&db.server, &db.tool))
            })
        });
        ranked.truncate(limit);

        ranked
            .into_iter()
            .map(|(doc_idx, score)| {
                let doc = &self.docs[doc_idx];
                SearchHit {
                    server: doc.server.clone(),
                    tool: doc.tool.clone(),
                    score,
                }
            })
            .collect()
    }
}

/// Lowercased terms split on non-alphanumerics and on camelCase boundaries,
/// including acronym tails ("HTTPServer" -> "http", "server").
pub fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();

    for i in 0..chars.len() {
        let c = chars[i];
        if !c.is_alphanumeric() {
            flush(&mut tokens, &mut current);
            continue;
        }

        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_is_lower) {
                flush(&mut tokens, &mut current);
            }
        }

        current.extend(c.to_lowercase());
    }
    flush(&mut tokens, &mut current);
    tokens
}

fn flush(tokens: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(std::mem::take(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolSchema;
    use serde_json::json;

    fn schema(name: &str, description: &str) -> ToolSchema {
        ToolSchema::new(name, Some(description), json!({ "type": "object" }))
    }

    #[test]
    fn tokenizer_splits_snake_kebab_and_camel() {
        assert_eq!(tokenize("git_commit"), vec!["git", "commit"]);
        assert_eq!(tokenize("create-pull-request"), vec!["create", "pull", "request"]);
        assert_eq!(tokenize("listIssues"), vec!["list", "issues"]);
        assert_eq!(tokenize("HTTPServer"), vec!["http", "server"]);
        assert_eq!(tokenize("readFileV2"), vec!["read", "file", "v2"]);
        assert!(tokenize("__--__").is_empty());
    }

    #[test]
    fn query_token_in_name_ranks_tool_first() {
        let tools = vec![
            ("git", schema("git_commit", "Create a git commit from staged changes")),
            ("git", schema("git_push", "Push commits to a remote")),
            ("fs", schema("read_file", "Read a file from disk")),
            ("web", schema("fetch_url", "Fetch a URL over HTTP")),
        ];
        let index = Bm25Index::build(tools.iter().map(|(s, t)| (*s, t)));

        let hits = index.query("commit", 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].tool, "git_commit");

        let hits = index.query("git commit", 10);
        assert_eq!(hits[0].tool, "git_commit");
        assert!(hits.iter().any(|h| h.tool == "git_push"));
    }

    #[test]
    fn description_terms_are_searchable() {
        let tools = vec![
            ("db", schema("run_query", "Execute a SQL statement against postgres")),
            ("fs", schema("read_file", "Read a file from disk")),
        ];
        let index = Bm25Index::build(tools.iter().map(|(s, t)| (*s, t)));
        let hits = index.query("postgres", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool, "run_query");
    }

    #[test]
    fn limit_caps_result_count() {
        let tools: Vec<(String, ToolSchema)> = (0..50)
            .map(|i| ("srv".to_string(), schema(&format!("tool_alpha_{i}"), "alpha tool")))
            .collect();
        let index = Bm25Index::build(tools.iter().map(|(s, t)| (s.as_str(), t)));
        assert_eq!(index.len(), 50);
        assert_eq!(index.query("alpha", 10).len(), 10);
    }

    #[test]
    fn empty_query_and_empty_index_return_nothing() {
        let index = Bm25Index::build(std::iter::empty());
        assert!(index.is_empty());
        assert!(index.query("anything", 10).is_empty());

        let tools = vec![("srv", schema("ping", "Reply with the input"))];
        let index = Bm25Index::build(tools.iter().map(|(s, t)| (*s, t)));
        assert!(index.query("", 10).is_empty());
        assert!(index.query("...", 10).is_empty());
    }

    #[test]
    fn rarer_terms_outweigh_common_ones() {
        let mut tools: Vec<(String, ToolSchema)> = (0..20)
            .map(|i| ("srv".to_string(), schema(&format!("file_op_{i}"), "file operation")))
            .collect();
        tools.push(("srv".to_string(), schema("encrypt_file", "Encrypt a file")));

        let index = Bm25Index::build(tools.iter().map(|(s, t)| (s.as_str(), t)));
        let hits = index.query("encrypt file", 5);
        assert_eq!(hits[0].tool, "encrypt_file");
    }
}
