use crate::arena::{required_size, Arena, Block};
use crate::strpool::{CacheMem, Release, StrRef};

use proptest::prelude::*;

const CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
enum ArenaOp {
    Allocate(usize),
    Release(usize),
    Resize(usize, usize),
}

fn arena_ops() -> impl Strategy<Value = Vec<ArenaOp>> {
    let op = prop_oneof![
        45 => (0usize..600).prop_map(ArenaOp::Allocate),
        30 => any::<usize>().prop_map(ArenaOp::Release),
        25 => (any::<usize>(), 0usize..900).prop_map(|(i, n)| ArenaOp::Resize(i, n)),
    ];
    prop::collection::vec(op, 0..200)
}

fn string_ops() -> impl Strategy<Value = Vec<(bool, String)>> {
    let s = "[a-d]{0,3}|host-[0-9]{1,2}|\\*";
    prop::collection::vec((any::<bool>(), s), 0..150)
}

fn fill(arena: &mut Arena, block: &Block, tag: u8) {
    arena.bytes_mut(block).fill(tag);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_arena_budget_never_exceeded(ops in arena_ops()) {
        let mut arena = Arena::new(CAPACITY);
        let mut live: Vec<(Block, u8)> = Vec::new();
        let mut next_tag = 1u8;

        for op in ops {
            let used_before = arena.used();
            match op {
                ArenaOp::Allocate(size) => match arena.allocate(size) {
                    Ok(block) => {
                        prop_assert_eq!(arena.used(), used_before + required_size(size));
                        fill(&mut arena, &block, next_tag);
                        live.push((block, next_tag));
                        next_tag = next_tag.wrapping_add(1).max(1);
                    }
                    Err(_) => prop_assert_eq!(arena.used(), used_before),
                },
                ArenaOp::Release(i) => {
                    if !live.is_empty() {
                        let (block, _) = live.swap_remove(i % live.len());
                        let chunk = required_size(block.len());
                        arena.release(block);
                        prop_assert_eq!(arena.used(), used_before - chunk);
                    }
                }
                ArenaOp::Resize(i, size) => {
                    if !live.is_empty() {
                        let index = i % live.len();
                        let (block, tag) = &mut live[index];
                        let old_len = block.len();
                        match arena.resize(block, size) {
                            Ok(()) => {
                                let keep = old_len.min(size);
                                prop_assert!(arena.bytes(block)[..keep].iter().all(|b| *b == *tag));
                                let tag = *tag;
                                fill(&mut arena, block, tag);
                            }
                            Err(_) => {
                                prop_assert_eq!(block.len(), old_len);
                                prop_assert_eq!(arena.used(), used_before);
                            }
                        }
                    }
                }
            }

            prop_assert!(arena.used() <= arena.capacity());
            let accounted: usize = live.iter().map(|(b, _)| required_size(b.len())).sum();
            prop_assert_eq!(arena.used(), accounted);
            prop_assert_eq!(arena.allocations(), live.len());
        }

        for (block, tag) in &live {
            prop_assert!(arena.bytes(block).iter().all(|b| b == tag));
        }

        for (block, _) in live {
            arena.release(block);
        }
        prop_assert_eq!(arena.used(), 0);
        prop_assert_eq!(arena.largest_free_chunk(), arena.capacity());
    }

    #[test]
    fn prop_string_pool_dedup_and_accounting(ops in string_ops()) {
        let mut mem = CacheMem::new(CAPACITY);
        let mut held: Vec<(String, StrRef)> = Vec::new();

        for (release, s) in ops {
            if release && !held.is_empty() {
                let (_, r) = held.remove(0);
                r.release(&mut mem);
            } else if let Ok(r) = mem.intern(&s) {
                if let Some((_, other)) = held.iter().find(|(text, _)| *text == s) {
                    prop_assert_eq!(other.id(), r.id());
                }
                held.push((s, r));
            }

            for (text, r) in &held {
                prop_assert_eq!(mem.get(r), text.as_str());
            }
            let mut distinct: Vec<&str> = held.iter().map(|(t, _)| t.as_str()).collect();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(mem.strings().len(), distinct.len());
            prop_assert_eq!(mem.strings().bytes_used(), mem.arena().used());
        }

        held.into_iter().map(|(_, r)| r).collect::<Vec<_>>().release(&mut mem);
        prop_assert_eq!(mem.arena().used(), 0);
        prop_assert!(mem.strings().is_empty());
    }

    #[test]
    fn prop_size_estimate_is_exact(
        preloaded in prop::collection::vec("[a-z]{1,12}", 0..10),
        planned in prop::collection::vec("[a-z]{1,12}", 0..30),
        blocks in prop::collection::vec(0usize..64, 0..10),
    ) {
        let mut mem = CacheMem::new(64 * 1024);
        let mut held = Vec::new();
        for s in &preloaded {
            held.push(mem.intern(s).unwrap());
        }

        let required = {
            let mut est = mem.estimate();
            for s in &planned {
                est.add_str(s);
            }
            for size in &blocks {
                est.add_block(*size);
            }
            est.total()
        };

        let before = mem.arena().used();
        for s in &planned {
            held.push(mem.intern(s).unwrap());
        }
        let mut allocated = Vec::new();
        for size in &blocks {
            allocated.push(mem.allocate(*size).unwrap());
        }
        prop_assert_eq!(mem.arena().used() - before, required);

        allocated.release(&mut mem);
        held.release(&mut mem);
        prop_assert_eq!(mem.arena().used(), 0);
    }
}
