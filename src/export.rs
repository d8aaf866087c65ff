//! Plain-text serialization of a trained model.
//!
//! One line per (substate-annotated) rule or emission, log probabilities in
//! natural log:
//!
//! ```text
//! NP_1 -> D_0 N_1 -0.2876820724517809
//! VP_0 -> V_1 -1.0986122886681098
//! N_1 -> dog -0.6931471805599453
//! ```
//!
//! Lines are emitted in sorted order so diffs between runs are meaningful.

use crate::grammar::Grammar;
use crate::lexicon::Lexicon;
use crate::symbol::TagSet;
use std::io::{self, Write};

/// Write every present, positive rule score as one line.
pub fn write_grammar<W: Write>(grammar: &Grammar, tags: &TagSet, out: &mut W) -> io::Result<()> {
    let mut lines = Vec::new();

    for rule in grammar.binary_rules() {
        let parent = tags.resolve(rule.parent);
        let left = tags.resolve(rule.left);
        let right = tags.resolve(rule.right);
        for (j, row) in rule.scores.iter().enumerate() {
            for (k, slot) in row.iter().enumerate() {
                let Some(slot) = slot else { continue };
                for (i, &score) in slot.iter().enumerate() {
                    if score > 0.0 {
                        lines.push(format!(
                            "{parent}_{i} -> {left}_{j} {right}_{k} {}",
                            score.ln()
                        ));
                    }
                }
            }
        }
    }

    for rule in grammar.unary_rules() {
        let parent = tags.resolve(rule.parent);
        let child = tags.resolve(rule.child);
        for (j, slot) in rule.scores.iter().enumerate() {
            let Some(slot) = slot else { continue };
            for (i, &score) in slot.iter().enumerate() {
                if score > 0.0 {
                    lines.push(format!("{parent}_{i} -> {child}_{j} {}", score.ln()));
                }
            }
        }
    }

    lines.sort();
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// Write the maximum-likelihood emission probabilities of every recorded
/// (tag, substate, word) triple.
pub fn write_lexicon<W: Write>(lexicon: &Lexicon, tags: &TagSet, out: &mut W) -> io::Result<()> {
    let mut lines = Vec::new();

    for state in tags.ids() {
        let tag = tags.resolve(state);
        for (word, counts) in lexicon.words(state) {
            for (sub, &count) in counts.iter().enumerate() {
                let total = lexicon.tag_total(state, sub);
                if count > 0.0 && total > 0.0 {
                    lines.push(format!("{tag}_{sub} -> {word} {}", (count / total).ln()));
                }
            }
        }
    }

    lines.sort();
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}
