use pptrie_core::{
    ConcurrentLevel, Error, LexIterator, Patricia, ReaderToken, Token, ValueHooks, WriterToken,
};
use proptest::collection::{hash_set, vec as pvec};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const ALL_WRITABLE: [ConcurrentLevel; 4] = [
    ConcurrentLevel::SingleThreadStrict,
    ConcurrentLevel::SingleThreadShared,
    ConcurrentLevel::OneWriteMultiRead,
    ConcurrentLevel::MultiWriteMultiRead,
];

fn val(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

fn insert_all(trie: &Patricia, keys: &[&[u8]]) {
    let mut w = WriterToken::new(trie).unwrap();
    w.acquire();
    for (i, key) in keys.iter().enumerate() {
        assert!(trie.insert(key, &val(i as u64), &mut w).unwrap());
        assert!(w.value().is_some());
    }
    w.release();
}

fn all_words(trie: &Patricia) -> Vec<Vec<u8>> {
    let mut it = trie.new_iter().unwrap();
    let mut out = Vec::new();
    let mut ok = it.seek_begin();
    while ok {
        out.push(it.word().to_vec());
        ok = it.incr();
    }
    out
}

#[test]
fn prefixes_do_not_alias() {
    for level in ALL_WRITABLE {
        let trie = Patricia::create(8, 1 << 16, level).unwrap();
        insert_all(&trie, &[b"a", b"ab", b"b"]);
        assert_eq!(trie.num_words(), 3);

        let mut r = ReaderToken::new(&trie).unwrap();
        r.acquire();
        assert!(trie.lookup(b"a", &mut r));
        assert_eq!(r.value_of::<u64>(), Some(0));
        assert!(trie.lookup(b"ab", &mut r));
        assert_eq!(r.value_of::<u64>(), Some(1));
        assert!(trie.lookup(b"b", &mut r));
        assert_eq!(r.value_of::<u64>(), Some(2));
        assert!(!trie.lookup(b"abc", &mut r));
        assert!(r.value().is_none());
        assert!(!trie.lookup(b"", &mut r));
        assert!(!trie.lookup(b"c", &mut r));
        r.release();
    }
}

#[test]
fn second_insert_keeps_first_value() {
    let trie = Patricia::with_defaults(8).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    assert!(trie.insert(b"key", &val(7), &mut w).unwrap());
    assert!(!trie.insert(b"key", &val(8), &mut w).unwrap());
    assert_eq!(w.value_of::<u64>(), Some(7));
    w.release();

    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(r.lookup(b"key"));
    assert_eq!(r.value(), Some(&val(7)[..]));
    assert_eq!(trie.num_words(), 1);
}

#[test]
fn splits_and_mark_final_are_counted() {
    let trie = Patricia::create(8, 1 << 16, ConcurrentLevel::SingleThreadStrict).unwrap();
    insert_all(&trie, &[b"abcdef"]);
    let st = trie.trie_stat();
    assert_eq!((st.n_fork, st.n_split, st.n_mark_final), (1, 0, 0));

    // diverges inside the compressed path "bcdef"
    insert_all(&trie, &[b"abcxyz"]);
    assert_eq!(trie.trie_stat().n_split, 1);

    // ends exactly at the node the split created
    insert_all(&trie, &[b"abc"]);
    assert_eq!(trie.trie_stat().n_mark_final, 1);

    // ends inside a compressed path
    insert_all(&trie, &[b"ab"]);
    let st = trie.trie_stat();
    assert_eq!(st.n_split, 2);
    assert_eq!(st.sum(), st.n_fork + st.n_split + st.n_mark_final + st.n_add_state_move);

    assert_eq!(trie.num_words(), 4);
    assert_eq!(
        all_words(&trie),
        vec![b"ab".to_vec(), b"abc".to_vec(), b"abcdef".to_vec(), b"abcxyz".to_vec()]
    );
}

#[test]
fn empty_key_is_a_word() {
    let trie = Patricia::with_defaults(8).unwrap();
    insert_all(&trie, &[b"", b"x"]);
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(r.lookup(b""));
    assert_eq!(r.value_of::<u64>(), Some(0));
    assert_eq!(all_words(&trie), vec![Vec::new(), b"x".to_vec()]);
}

#[test]
fn exhausted_pool_reports_null_value() {
    for level in ALL_WRITABLE {
        let trie = Patricia::create(8, 512, level).unwrap();
        let mut w = WriterToken::new(&trie).unwrap();
        w.acquire();
        let mut inserted = Vec::new();
        let mut failed = None;
        for i in 0..200u64 {
            let key = format!("key-{i:03}");
            assert!(trie.insert(key.as_bytes(), &val(i), &mut w).unwrap());
            if w.value().is_none() {
                failed = Some(key);
                break;
            }
            inserted.push((key, i));
        }
        w.release();
        let failed = failed.expect("a 512 byte pool must run out");
        assert_eq!(trie.num_words(), inserted.len());

        let mut r = ReaderToken::new(&trie).unwrap();
        r.acquire();
        assert!(!r.lookup(failed.as_bytes()));
        for (key, i) in &inserted {
            assert!(r.lookup(key.as_bytes()), "{key} lost at {level}");
            assert_eq!(r.value_of::<u64>(), Some(*i));
        }
        let st = trie.mem_get_stat();
        assert!(st.used_size + st.frag_size <= st.capacity);
    }
}

#[test]
fn too_small_pool_is_rejected() {
    assert_eq!(
        Patricia::create(8, 8, ConcurrentLevel::OneWriteMultiRead).unwrap_err(),
        Error::ZeroCapacity
    );
}

#[test]
fn readonly_is_one_way() {
    let trie = Patricia::with_defaults(8).unwrap();
    insert_all(&trie, &[b"before"]);
    assert!(!trie.is_readonly());
    trie.set_readonly();
    trie.set_readonly();
    assert!(trie.is_readonly());

    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    assert_eq!(trie.insert(b"after", &val(1), &mut w), Err(Error::ReadOnly));
    w.release();

    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(r.lookup(b"before"));
    assert!(!r.lookup(b"after"));
    assert_eq!(trie.num_words(), 1);
}

#[test]
fn read_only_level_rejects_inserts() {
    let trie = Patricia::create(8, 4096, ConcurrentLevel::NoWriteReadOnly).unwrap();
    assert!(trie.is_readonly());
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    assert_eq!(trie.insert(b"k", &val(1), &mut w), Err(Error::ReadOnly));
    w.release();
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(!r.lookup(b"k"));
}

#[test]
fn value_size_is_checked() {
    let trie = Patricia::with_defaults(8).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    assert_eq!(
        trie.insert(b"k", b"short", &mut w),
        Err(Error::ValueSize { expected: 8, got: 5 })
    );
    assert_eq!(trie.num_words(), 0);
}

#[test]
fn zero_sized_values_make_a_set() {
    let trie = Patricia::create(0, 1 << 14, ConcurrentLevel::MultiWriteMultiRead).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    assert!(trie.insert(b"x", &[], &mut w).unwrap());
    assert_eq!(w.value(), Some(&[0u8; 0][..]));
    assert!(trie.insert(b"xy", &[], &mut w).unwrap());
    assert!(!trie.insert(b"x", &[], &mut w).unwrap());
    w.release();

    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(r.lookup(b"xy"));
    assert!(!r.lookup(b"y"));
    assert_eq!(trie.num_words(), 2);
}

#[derive(Default)]
struct Counting {
    inits: Arc<AtomicUsize>,
}

impl ValueHooks for Counting {
    fn init_value(&mut self, dst: &mut [u8], src: &[u8]) -> bool {
        if src[0] == 0xFF {
            return false;
        }
        self.inits.fetch_add(1, Ordering::Relaxed);
        // stored values are the source with every byte incremented
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s.wrapping_add(1);
        }
        true
    }
}

#[test]
fn value_hooks_build_and_reject() {
    let trie = Patricia::with_defaults(4).unwrap();
    let hooks = Counting::default();
    let inits = Arc::clone(&hooks.inits);
    let mut w = WriterToken::with_hooks(&trie, Box::new(hooks)).unwrap();
    w.acquire();
    assert!(trie.insert(b"ok", &[1, 2, 3, 4], &mut w).unwrap());
    assert_eq!(w.value(), Some(&[2u8, 3, 4, 5][..]));
    assert_eq!(trie.insert(b"bad", &[0xFF, 0, 0, 0], &mut w), Err(Error::ValueRejected));
    w.release();

    assert_eq!(inits.load(Ordering::Relaxed), 1);
    assert_eq!(trie.num_words(), 1);
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(!r.lookup(b"bad"));
    // nothing leaked into the pool from the rejected value
    let st = trie.mem_get_stat();
    assert_eq!(st.fastbin[0], 1);
}

#[test]
fn mutable_value_is_seen_by_later_lookups() {
    let trie = Patricia::create(8, 1 << 14, ConcurrentLevel::SingleThreadStrict).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    trie.insert(b"counter", &val(0), &mut w).unwrap();
    for _ in 0..5 {
        // SAFETY: single-threaded test, nobody else reads the value
        let c = unsafe { w.mutable_value_of::<u64>() }.unwrap();
        *c += 1;
    }
    w.release();
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(r.lookup(b"counter"));
    assert_eq!(r.value_of::<u64>(), Some(5));
}

#[test]
fn iterator_walks_both_ways() {
    let trie = Patricia::with_defaults(8).unwrap();
    let keys: [&[u8]; 7] = [b"banana", b"apple", b"app", b"b", b"cherry", b"applesauce", b"ba"];
    insert_all(&trie, &keys);
    let mut sorted: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
    sorted.sort();
    assert_eq!(all_words(&trie), sorted);

    let mut it = trie.new_iter().unwrap();
    let mut backwards = Vec::new();
    let mut ok = it.seek_end();
    while ok {
        backwards.push(it.word().to_vec());
        ok = it.decr();
    }
    backwards.reverse();
    assert_eq!(backwards, sorted);
    assert!(!it.is_valid());

    assert!(it.seek_lower_bound(b"apples"));
    assert_eq!(it.word(), b"applesauce");
    assert!(it.value().is_some());
    assert!(it.seek_lower_bound(b"b"));
    assert_eq!(it.word(), b"b");
    assert!(it.seek_lower_bound(b"bb"));
    assert_eq!(it.word(), b"cherry");
    assert!(!it.seek_lower_bound(b"d"));
    assert!(it.seek_lower_bound(b""));
    assert_eq!(it.word(), b"app");
    assert!(!it.decr());
}

#[test]
fn iterator_rooted_at_a_state() {
    let trie = Patricia::with_defaults(8).unwrap();
    insert_all(&trie, &[b"ab", b"abc", b"abd", b"b"]);
    trie.set_readonly();
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    let state = trie.state_of(b"ab", &r).unwrap();
    assert!(trie.state_of(b"zz", &r).is_none());
    let mut it = trie.new_iter_at(state).unwrap();
    let mut words = Vec::new();
    let mut ok = it.seek_begin();
    while ok {
        words.push(it.word().to_vec());
        ok = it.incr();
    }
    assert_eq!(words, vec![b"".to_vec(), b"c".to_vec(), b"d".to_vec()]);
}

#[test]
fn writable_trie_hands_out_only_the_root_state() {
    let trie = Patricia::create(8, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
    insert_all(&trie, &[b"ab", b"abc"]);
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(trie.state_of(b"ab", &r).is_none());
    let root = trie.state_of(b"", &r).unwrap();
    assert_eq!(root, trie.initial_state());
    r.release();

    // supersede and reclaim every node under "ab" many times over
    let mut w = WriterToken::new(&trie).unwrap();
    for i in 0..2_000u32 {
        w.acquire();
        let key = format!("ab{i:04}");
        assert!(trie.insert(key.as_bytes(), &val(i as u64), &mut w).unwrap());
        w.release();
    }
    trie.gc();
    assert!(trie.mem_frag_size() > 0);

    // the root state follows the live root
    let mut it = trie.new_iter_at(root).unwrap();
    let mut n = 0;
    let mut ok = it.seek_begin();
    while ok {
        n += 1;
        ok = it.incr();
    }
    assert_eq!(n, 2_002);
    drop(it);

    trie.set_readonly();
    r.acquire();
    assert!(trie.state_of(b"ab", &r).is_some());
}

#[test]
fn state_of_another_trie_is_rejected() {
    let a = Patricia::with_defaults(8).unwrap();
    let b = Patricia::with_defaults(8).unwrap();
    insert_all(&a, &[b"ab", b"abc"]);
    a.set_readonly();
    let mut r = ReaderToken::new(&a).unwrap();
    r.acquire();
    let state = a.state_of(b"ab", &r).unwrap();
    assert_eq!(b.new_iter_at(state).err(), Some(Error::ForeignState));
    assert_eq!(b.new_iter_at(a.initial_state()).err(), Some(Error::ForeignState));
    assert!(a.new_iter_at(state).is_ok());
}

#[test]
fn levels_agree_on_contents_and_stats() {
    let keys: Vec<String> = (0..300).map(|i| format!("{:x}", i * 7919)).collect();
    let build = |level| {
        let trie = Patricia::create(8, 1 << 20, level).unwrap();
        let mut w = WriterToken::new(&trie).unwrap();
        w.acquire();
        for (i, k) in keys.iter().enumerate() {
            trie.insert(k.as_bytes(), &val(i as u64), &mut w).unwrap();
        }
        w.release();
        drop(w);
        let words = all_words(&trie);
        (trie.trie_stat(), trie.num_words(), words)
    };
    let strict = build(ConcurrentLevel::SingleThreadStrict);
    let multi = build(ConcurrentLevel::MultiWriteMultiRead);
    assert_eq!(strict, multi);
    assert_eq!(strict.1, keys.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn property_insert_lookup_iterate(
        keys in hash_set(pvec(0u8..4, 0..7), 1..64),
        queries in pvec(pvec(0u8..4, 0..7), 0..32),
        level_idx in 0usize..4,
    ) {
        let level = ALL_WRITABLE[level_idx];
        let trie = Patricia::create(8, 1 << 18, level).unwrap();
        let keys: Vec<Vec<u8>> = keys.into_iter().collect();
        let mut w = WriterToken::new(&trie).unwrap();
        w.acquire();
        for (i, k) in keys.iter().enumerate() {
            prop_assert!(trie.insert(k, &val(i as u64), &mut w).unwrap());
            prop_assert!(w.value().is_some());
        }
        w.release();
        prop_assert_eq!(trie.num_words(), keys.len());

        let mut r = ReaderToken::new(&trie).unwrap();
        r.acquire();
        for (i, k) in keys.iter().enumerate() {
            prop_assert!(r.lookup(k));
            prop_assert_eq!(r.value_of::<u64>(), Some(i as u64));
        }
        let set: BTreeSet<Vec<u8>> = keys.iter().cloned().collect();
        for p in &queries {
            prop_assert_eq!(r.lookup(p), set.contains(p));
        }
        r.release();

        let expected: Vec<Vec<u8>> = set.into_iter().collect();
        prop_assert_eq!(all_words(&trie), expected);
    }
}
