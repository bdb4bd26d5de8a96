#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tickwatch_core::{CodecConfig, SnapshotCodec, Value};

#[derive(Arbitrary, Debug)]
enum Tree {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Sequence(Vec<Tree>),
    Record(Vec<(String, Tree)>),
}

impl Tree {
    fn build(&self) -> Value {
        match self {
            Tree::Null => Value::Null,
            Tree::Bool(b) => Value::Bool(*b),
            Tree::Number(n) => Value::Number(*n),
            Tree::Text(s) => Value::Text(s.clone()),
            Tree::Sequence(items) => Value::sequence(items.iter().map(Tree::build)),
            Tree::Record(entries) => {
                Value::record(entries.iter().map(|(k, v)| (k.clone(), v.build())))
            }
        }
    }
}

#[derive(Arbitrary, Debug)]
struct Input {
    tree: Tree,
    window: u8,
    depth: u8,
    self_loop: bool,
}

fuzz_target!(|input: Input| {
    let codec = SnapshotCodec::new(CodecConfig {
        window: usize::from(input.window),
        max_depth: usize::from(input.depth % 16),
    });
    let value = input.tree.build();

    let looped = match (&value, input.self_loop) {
        (Value::Record(node), true) => {
            node.borrow_mut().insert("self".into(), value.clone());
            true
        }
        _ => false,
    };

    let first = codec.fingerprint(&value);
    assert_eq!(first, codec.fingerprint(&value));

    if let Ok(copy) = codec.deep_copy(&value)
        && !looped
    {
        assert_eq!(codec.fingerprint(&copy), first);
    }

    if let (Value::Record(node), true) = (&value, looped) {
        node.borrow_mut().shift_remove("self");
    }
});
