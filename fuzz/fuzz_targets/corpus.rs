//! Fuzz target for corpus parsing.
//!
//! Arbitrary bytes must either parse into a corpus or produce a `CorpusError`,
//! and a parsed corpus must hold unique, resolvable ids.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use clause_retriever::corpus::Corpus;

#[derive(Arbitrary, Debug)]
struct CorpusInput {
    raw: Vec<u8>,
    fields: Vec<String>,
}

fuzz_target!(|input: CorpusInput| {
    let fields = if input.fields.is_empty() {
        vec!["text".to_string()]
    } else {
        input.fields
    };
    if let Ok(corpus) = Corpus::from_slice(&input.raw, &fields, "fuzz") {
        for (idx, doc) in corpus.documents().iter().enumerate() {
            assert_eq!(corpus.position(&doc.id), Some(idx));
        }
        let _ = corpus.lexical_index();
    }
});
