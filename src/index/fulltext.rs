//! BM25 inverted index over designated text properties.
//!
//! For each indexed node, the string values of the allow-listed property keys
//! are concatenated and tokenized. Scoring is Okapi BM25 with k1 = 1.2,
//! b = 0.75 and the smoothed IDF `ln((N - df + 0.5) / (df + 0.5) + 1)`.
//! Query terms of three or more characters also match indexed terms by
//! prefix, so `auth` finds `authentication`.
//!
//! Ranking is deterministic: equal scores tie-break on node id, and
//! re-indexing the same corpus reproduces identical scores.

use std::collections::{BTreeMap, HashMap};

use crate::model::{Node, NodeId, Value};

const K1: f64 = 1.2;
const B: f64 = 0.75;
const MIN_TOKEN_LEN: usize = 2;
const PREFIX_MATCH_MIN_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with",
];

/// In-memory inverted index. One instance per named full-text index.
pub struct FulltextIndex {
    allowlist: Vec<String>,
    ascii_folding: bool,
    /// term → (doc → term frequency). BTreeMap so prefix expansion is a
    /// bounded range walk.
    postings: BTreeMap<String, HashMap<u64, u32>>,
    /// doc → its term frequencies, for O(terms) removal.
    doc_terms: HashMap<u64, HashMap<String, u32>>,
    doc_len: HashMap<u64, u32>,
    doc_labels: HashMap<u64, Vec<String>>,
    total_len: u64,
}

impl FulltextIndex {
    pub fn new(allowlist: Vec<String>, ascii_folding: bool) -> Self {
        Self {
            allowlist,
            ascii_folding,
            postings: BTreeMap::new(),
            doc_terms: HashMap::new(),
            doc_len: HashMap::new(),
            doc_labels: HashMap::new(),
            total_len: 0,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_len.len()
    }

    /// Index (or re-index) one node. Nodes with no indexable text simply
    /// don't enter the index.
    pub fn index_node(&mut self, node: &Node) {
        self.remove_node(node.id);

        let text = self.collect_text(node);
        let tokens = self.tokenize(&text);
        if tokens.is_empty() {
            return;
        }

        let mut freqs: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *freqs.entry(token.clone()).or_insert(0) += 1;
        }
        for (term, tf) in &freqs {
            self.postings.entry(term.clone()).or_default().insert(node.id.0, *tf);
        }
        self.total_len += tokens.len() as u64;
        self.doc_len.insert(node.id.0, tokens.len() as u32);
        self.doc_terms.insert(node.id.0, freqs);
        self.doc_labels.insert(node.id.0, node.labels.clone());
    }

    pub fn remove_node(&mut self, id: NodeId) {
        let Some(freqs) = self.doc_terms.remove(&id.0) else {
            return;
        };
        for term in freqs.keys() {
            if let Some(docs) = self.postings.get_mut(term) {
                docs.remove(&id.0);
                if docs.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        if let Some(len) = self.doc_len.remove(&id.0) {
            self.total_len -= u64::from(len);
        }
        self.doc_labels.remove(&id.0);
    }

    /// Top-k BM25 matches, descending score, tie-broken by node id.
    pub fn query(&self, text: &str, k: usize, label_filter: Option<&str>) -> Vec<(NodeId, f64)> {
        let n = self.doc_len.len() as f64;
        if n == 0.0 || k == 0 {
            return Vec::new();
        }
        let avg_len = self.total_len as f64 / n;

        let mut scores: HashMap<u64, f64> = HashMap::new();
        for term in self.tokenize(text) {
            for (df, docs) in self.matching_postings(&term) {
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                for (&doc, &tf) in docs {
                    let tf = f64::from(tf);
                    let dl = f64::from(self.doc_len[&doc]);
                    let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * dl / avg_len));
                    *scores.entry(doc).or_insert(0.0) += idf * norm;
                }
            }
        }

        let mut hits: Vec<(NodeId, f64)> = scores
            .into_iter()
            .filter(|(doc, _)| {
                label_filter.is_none_or(|label| {
                    self.doc_labels
                        .get(doc)
                        .is_some_and(|labels| labels.iter().any(|l| l == label))
                })
            })
            .map(|(doc, score)| (NodeId(doc), score))
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }

    /// Postings for a query term: the exact term plus, for terms long enough,
    /// every indexed term it prefixes. Each matched term contributes with its
    /// own document frequency.
    fn matching_postings(&self, term: &str) -> Vec<(f64, &HashMap<u64, u32>)> {
        let mut out = Vec::new();
        if term.len() >= PREFIX_MATCH_MIN_LEN {
            for (indexed, docs) in self.postings.range(term.to_owned()..) {
                if !indexed.starts_with(term) {
                    break;
                }
                out.push((docs.len() as f64, docs));
            }
        } else if let Some(docs) = self.postings.get(term) {
            out.push((docs.len() as f64, docs));
        }
        out
    }

    fn collect_text(&self, node: &Node) -> String {
        let mut parts = Vec::new();
        for key in &self.allowlist {
            if let Some(Value::String(s)) = node.properties.get(key) {
                parts.push(s.as_str());
            }
        }
        parts.join(" ")
    }

    /// Lowercase, split on non-alphanumeric/underscore boundaries, drop short
    /// tokens and stop words. No stemming.
    fn tokenize(&self, text: &str) -> Vec<String> {
        let folded;
        let text = if self.ascii_folding {
            folded = fold_ascii(text);
            folded.as_str()
        } else {
            text
        };
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(str::to_lowercase)
            .filter(|t| t.len() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(&t.as_str()))
            .collect()
    }
}

/// Best-effort folding of common accented Latin characters.
fn fold_ascii(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
            'è' | 'é' | 'ê' | 'ë' => 'e',
            'ì' | 'í' | 'î' | 'ï' => 'i',
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
            'ù' | 'ú' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
            'È' | 'É' | 'Ê' | 'Ë' => 'E',
            'Ç' => 'C',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: u64, content: &str) -> Node {
        Node::new(NodeId(id))
            .with_labels(["Doc"])
            .with_property("content", content)
    }

    fn index(docs: &[(u64, &str)]) -> FulltextIndex {
        let mut idx = FulltextIndex::new(vec!["content".into(), "title".into()], true);
        for (id, content) in docs {
            idx.index_node(&doc(*id, content));
        }
        idx
    }

    #[test]
    fn test_basic_ranking() {
        let idx = index(&[
            (1, "authentication bug in the login flow"),
            (2, "database storage engine"),
            (3, "authentication authentication everywhere"),
        ]);
        let hits = idx.query("authentication", 10, None);
        assert_eq!(hits.len(), 2);
        // Doc 3 repeats the term, so it outranks doc 1.
        assert_eq!(hits[0].0, NodeId(3));
        assert_eq!(hits[1].0, NodeId(1));
    }

    #[test]
    fn test_prefix_matching() {
        let idx = index(&[(1, "authentication layer")]);
        // Prefix match applies to query terms of 3+ characters.
        assert_eq!(idx.query("auth", 10, None).len(), 1);
        assert!(idx.query("au", 10, None).is_empty());
    }

    #[test]
    fn test_stop_words_and_short_tokens() {
        let idx = index(&[(1, "x of the to a")]);
        // Everything tokenizes away, so the node never enters the index.
        assert_eq!(idx.doc_count(), 0);
    }

    #[test]
    fn test_label_filter() {
        let mut idx = FulltextIndex::new(vec!["content".into()], false);
        idx.index_node(&doc(1, "shared term"));
        let other = Node::new(NodeId(2))
            .with_labels(["Memo"])
            .with_property("content", "shared term");
        idx.index_node(&other);

        assert_eq!(idx.query("shared", 10, None).len(), 2);
        let filtered = idx.query("shared", 10, Some("Memo"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, NodeId(2));
    }

    #[test]
    fn test_remove_node() {
        let mut idx = index(&[(1, "ephemeral text"), (2, "ephemeral note")]);
        idx.remove_node(NodeId(1));
        let hits = idx.query("ephemeral", 10, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, NodeId(2));
    }

    #[test]
    fn test_reindex_is_deterministic() {
        let docs = &[
            (1u64, "graph database with vector search"),
            (2, "vector similarity ranking"),
            (3, "keyword search ranking"),
        ];
        let a = index(docs);
        let b = index(docs);
        assert_eq!(a.query("vector ranking", 10, None), b.query("vector ranking", 10, None));
    }

    #[test]
    fn test_multiple_properties_concatenated() {
        let mut idx = FulltextIndex::new(vec!["content".into(), "title".into()], false);
        let node = Node::new(NodeId(1))
            .with_labels(["Doc"])
            .with_property("title", "release checklist")
            .with_property("content", "ship the build");
        idx.index_node(&node);
        assert_eq!(idx.query("checklist", 10, None).len(), 1);
        assert_eq!(idx.query("ship", 10, None).len(), 1);
    }
}
