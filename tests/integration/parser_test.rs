//! Parser round-trip law: any chunking of a reply yields the same operations
//! as feeding it whole.

use plandex_core::OperationType;
use plandex_server::services::reply::ReplyParser;

const REPLIES: &[&str] = &[
    // prose only
    "Just an explanation, no operations at all.\n",
    // one labelled file block
    "Creating the entry point.\n\n- src/main.rs\n\n\
     <PlandexBlock lang=\"rust\" path=\"src/main.rs\">\n\
     fn main() {\n    println!(\"hi\");\n}\n\
     </PlandexBlock>\n\nDone.\n",
    // xml-path block without label, plus ops sections
    "Refactoring.\n\n\
     <PlandexBlock lang=\"rust\" path=\"src/lib.rs\">\npub mod core;\n</PlandexBlock>\n\n\
     ### Move Files\n- `src/old.rs` → `src/core/old.rs`\n<EndPlandexFileOps/>\n\n\
     ### Remove Files\n- `scratch.txt`\n<EndPlandexFileOps/>\n\n\
     ### Reset Changes\n- `src/main.rs`\n<EndPlandexFileOps/>\n",
    // two file blocks back to back
    "- a.py\n\n<PlandexBlock lang=\"python\" path=\"a.py\">\nprint('a')\n</PlandexBlock>\n\n\
     - b.py\n\n<PlandexBlock lang=\"python\" path=\"b.py\">\nprint('b')\n</PlandexBlock>\n",
];

fn parse_with_chunking(reply: &str, chunk_size: usize) -> Vec<plandex_core::Operation> {
    let mut parser = ReplyParser::new();
    let chars: Vec<char> = reply.chars().collect();
    for chunk in chars.chunks(chunk_size) {
        parser.add_chunk(&chunk.iter().collect::<String>(), true);
    }
    let mut ops = parser.finish_and_read().operations;
    // token counts track chunk arrival; the law is about structure
    for op in &mut ops {
        op.num_tokens = 0;
    }
    ops
}

#[test]
fn test_round_trip_under_arbitrary_chunking() {
    for reply in REPLIES {
        let whole = parse_with_chunking(reply, reply.len().max(1));

        for chunk_size in [1usize, 2, 3, 5, 11, 64, 1024] {
            let chunked = parse_with_chunking(reply, chunk_size);
            assert_eq!(
                chunked, whole,
                "chunk size {} diverged for reply: {:?}",
                chunk_size, reply
            );
        }
    }
}

#[test]
fn test_mixed_reply_operation_kinds() {
    let ops = parse_with_chunking(REPLIES[2], 7);
    let kinds: Vec<OperationType> = ops.iter().map(|op| op.op_type).collect();
    assert_eq!(
        kinds,
        vec![
            OperationType::File,
            OperationType::Move,
            OperationType::Remove,
            OperationType::Reset
        ]
    );
    assert_eq!(ops[1].destination.as_deref(), Some("src/core/old.rs"));
}

#[test]
fn test_two_blocks_capture_both_contents() {
    let ops = parse_with_chunking(REPLIES[3], 3);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].path, "a.py");
    assert_eq!(ops[0].content, "print('a')\n");
    assert_eq!(ops[1].path, "b.py");
    assert_eq!(ops[1].content, "print('b')\n");
}
