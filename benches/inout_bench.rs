//! Benchmark of the inside-outside engine and one EM iteration.
//!
//! Run with: cargo bench --bench inout_bench

use std::time::Instant;

use latent_pcfg::grammar::{Grammar, NoSmoothing};
use latent_pcfg::inout::ArrayParser;
use latent_pcfg::lexicon::Lexicon;
use latent_pcfg::rules::{BinaryRule, UnaryRule};
use latent_pcfg::symbol::{StateId, TagSet};
use latent_pcfg::trainer::em_iteration;
use latent_pcfg::tree::{alloc_tree_scores, annotate, release_tree_scores, StateSet, Tree};
use rand::rngs::StdRng;
use rand::SeedableRng;

const ITERATIONS: usize = 200;

/// Right-branching X -> P X chains over `n` tokens.
fn chain_tree(n: usize) -> Tree<String> {
    let pre = |_: usize| Tree::node("P".to_string(), vec![Tree::leaf("w".to_string())]);
    let mut t = Tree::node("X".to_string(), vec![pre(n - 1)]);
    for i in (0..n - 1).rev() {
        t = Tree::node("X".to_string(), vec![pre(i), t]);
    }
    Tree::node("ROOT".to_string(), vec![t])
}

fn chain_model(tags: &TagSet, substates: u16) -> (Grammar, Lexicon) {
    let x = tags.lookup("X").unwrap();
    let p = tags.lookup("P").unwrap();
    let k = substates as usize;

    let mut counts = vec![substates; tags.len()];
    counts[StateId::ROOT.as_usize()] = 1;
    let mut grammar = Grammar::new(counts.clone());

    let mut root_rule = UnaryRule::empty(StateId::ROOT, x, k);
    for j in 0..k {
        root_rule.slot_mut(j, 1)[0] = 1.0 / k as f64;
    }
    grammar.insert_unary(root_rule);
    let mut chain = BinaryRule::empty(x, p, x, k, k);
    for j in 0..k {
        for kk in 0..k {
            for slot in chain.slot_mut(j, kk, k).iter_mut() {
                *slot = 0.4 / (k * k) as f64;
            }
        }
    }
    grammar.insert_binary(chain);
    let mut stop = UnaryRule::empty(x, p, k);
    for j in 0..k {
        for slot in stop.slot_mut(j, k).iter_mut() {
            *slot = 0.6 / k as f64;
        }
    }
    grammar.insert_unary(stop);

    let mut lexicon = Lexicon::new(counts, 0.0, [0.1, 0.1]);
    let pre = Tree::node(
        StateSet::new(p, 1, 0, 1),
        vec![Tree::leaf(StateSet::leaf(p, "w", 0))],
    );
    lexicon.tally_uninitialized_tree(&pre);
    lexicon.register_unseen_stats();
    (grammar, lexicon)
}

fn bench_inside_outside(length: usize, substates: u16) -> f64 {
    let mut tags = TagSet::new("ROOT");
    let mut tree = annotate(&chain_tree(length), &mut tags).unwrap();
    let (grammar, lexicon) = chain_model(&tags, substates);
    let mut counts = vec![substates; tags.len()];
    counts[StateId::ROOT.as_usize()] = 1;
    latent_pcfg::resize_substates(&mut tree, &counts);

    let parser = ArrayParser::new(&grammar, &lexicon);
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        alloc_tree_scores(&mut tree);
        parser.compute_inside_outside(&mut tree, true, None).unwrap();
        release_tree_scores(&mut tree);
    }
    start.elapsed().as_secs_f64() * 1000.0
}

fn bench_em_iteration(corpus: usize, length: usize, substates: u16) -> f64 {
    let mut tags = TagSet::new("ROOT");
    let mut trees: Vec<_> = (0..corpus)
        .map(|_| annotate(&chain_tree(length), &mut tags).unwrap())
        .collect();
    let (mut grammar, mut lexicon) = chain_model(&tags, substates);
    let mut counts = vec![substates; tags.len()];
    counts[StateId::ROOT.as_usize()] = 1;
    for tree in trees.iter_mut() {
        latent_pcfg::resize_substates(tree, &counts);
    }

    let mut rng = StdRng::seed_from_u64(0);
    let start = Instant::now();
    for _ in 0..10 {
        let (g, l, stats) =
            em_iteration(&grammar, &lexicon, &mut trees, &NoSmoothing, 1e-30, &mut rng).unwrap();
        assert!(stats.log_likelihood.is_finite());
        grammar = g;
        lexicon = l;
    }
    start.elapsed().as_secs_f64() * 1000.0
}

fn main() {
    println!("=======================================================================");
    println!("Inside-Outside Micro-benchmarks");
    println!("=======================================================================");
    println!();

    println!("1. Inside-outside, {} passes per configuration", ITERATIONS);
    for &(length, substates) in &[(10, 1u16), (10, 8), (40, 1), (40, 8)] {
        let ms = bench_inside_outside(length, substates);
        println!(
            "   length {:>3}, {} substates: {:>8.2} ms ({:>7.3} ms/pass)",
            length,
            substates,
            ms,
            ms / ITERATIONS as f64
        );
    }
    println!();

    println!("2. EM iteration, 10 iterations over 50 trees");
    for &substates in &[1u16, 4, 8] {
        let ms = bench_em_iteration(50, 20, substates);
        println!(
            "   {} substates: {:>8.2} ms ({:>7.2} ms/iteration)",
            substates,
            ms,
            ms / 10.0
        );
    }
    println!();
    println!("=======================================================================");
}
