use pptrie_core::{
    ConcurrentLevel, LexIterator, Patricia, ReaderToken, Token, TokenKind, TokenState,
    WriterToken,
};

fn val(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

#[test]
fn stamps_are_strictly_increasing() {
    for level in [
        ConcurrentLevel::NoWriteReadOnly,
        ConcurrentLevel::SingleThreadStrict,
        ConcurrentLevel::SingleThreadShared,
        ConcurrentLevel::OneWriteMultiRead,
        ConcurrentLevel::MultiWriteMultiRead,
    ] {
        let trie = Patricia::create(8, 1 << 14, level).unwrap();
        let mut a = ReaderToken::new(&trie).unwrap();
        let mut b = ReaderToken::new(&trie).unwrap();
        let mut last = 0;
        for _ in 0..10 {
            a.acquire();
            assert!(a.verseq() > last);
            b.acquire();
            assert!(b.verseq() > a.verseq());
            last = b.verseq();
            a.release();
            b.release();
        }
    }
}

#[test]
fn state_machine_walk() {
    let trie = Patricia::with_defaults(8).unwrap();
    let mut r = ReaderToken::new(&trie).unwrap();
    assert_eq!(r.state(), TokenState::ReleaseDone);
    assert_eq!(r.kind(), TokenKind::Reader);
    assert!(!r.is_acquired());
    r.acquire();
    assert_eq!(r.state(), TokenState::AcquireDone);
    r.release();
    // nobody else scans, so the release completes inline
    assert_eq!(r.state(), TokenState::ReleaseDone);
    r.acquire();
    r.dispose();

    let w = WriterToken::new(&trie).unwrap();
    assert_eq!(w.kind(), TokenKind::Writer);
    assert_eq!(w.thread_id(), WriterToken::new(&trie).unwrap().thread_id());
}

#[test]
fn update_takes_a_fresh_stamp() {
    let trie = Patricia::create(8, 1 << 14, ConcurrentLevel::SingleThreadShared).unwrap();
    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    let first = r.verseq();
    r.update();
    assert!(r.verseq() > first);
    assert!(r.is_acquired());

    // below SingleThreadShared update does nothing
    let strict = Patricia::create(8, 1 << 14, ConcurrentLevel::SingleThreadStrict).unwrap();
    let mut r = ReaderToken::new(&strict).unwrap();
    r.acquire();
    let first = r.verseq();
    r.update();
    assert_eq!(r.verseq(), first);
}

#[test]
fn old_reader_holds_back_reclamation() {
    let trie = Patricia::create(8, 1 << 16, ConcurrentLevel::OneWriteMultiRead).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    trie.insert(b"seed", &val(0), &mut w).unwrap();
    w.release();

    let mut old = ReaderToken::new(&trie).unwrap();
    old.acquire();
    assert!(old.lookup(b"seed"));

    w.acquire();
    for i in 1..40u64 {
        trie.insert(format!("k{i}").as_bytes(), &val(i), &mut w).unwrap();
    }
    w.release();
    trie.gc();
    let held = trie.mem_get_stat();
    assert!(held.lazy_free_cnt > 0, "superseded nodes must wait for the old reader");
    assert!(trie.min_age() <= old.verseq());
    assert!(old.min_age() <= old.verseq());

    // the stale reader still walks its view safely
    assert!(old.lookup(b"seed"));
    assert_eq!(old.value_of::<u64>(), Some(0));

    old.release();
    trie.gc();
    let st = trie.mem_get_stat();
    assert_eq!(st.lazy_free_cnt, 0);
    assert_eq!(st.lazy_free_sum, 0);
    assert!(st.frag_size >= held.lazy_free_sum);
    assert!(trie.min_age() > old.verseq());
}

#[test]
fn held_writer_scans_are_amortised() {
    const KEYS: u32 = 5_000;
    let trie = Patricia::create(8, 64 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    let runs = trie.gc_runs();
    for k in 0..KEYS {
        assert!(trie.insert(&k.to_be_bytes(), &val(k as u64), &mut w).unwrap());
        assert!(w.value().is_some(), "pool exhausted at {k}");
    }
    let held = trie.mem_get_stat();
    // the writer pins the horizon, so nothing retired under it is freed
    assert!(held.lazy_free_cnt >= KEYS as usize);
    // scans back off geometrically instead of running on every retire
    let scans = trie.gc_runs() - runs;
    assert!(scans <= 16, "{scans} scans for {} pending blocks", held.lazy_free_cnt);

    w.release();
    let st = trie.mem_get_stat();
    assert_eq!(st.lazy_free_cnt, 0);
    assert_eq!(st.lazy_free_sum, 0);
    assert_eq!(trie.num_words(), KEYS as usize);
}

#[test]
fn strict_level_frees_immediately() {
    let trie = Patricia::create(8, 1 << 16, ConcurrentLevel::SingleThreadStrict).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    for i in 0..20u64 {
        trie.insert(format!("k{i}").as_bytes(), &val(i), &mut w).unwrap();
    }
    w.release();
    let st = trie.mem_get_stat();
    assert_eq!(st.lazy_free_cnt, 0);
    // superseded nodes went straight back to the free lists
    assert!(st.frag_size > 0);
    assert!(!trie.gc(), "no scans without tracked tokens");
}

#[test]
fn readonly_readers_are_not_tracked() {
    let trie = Patricia::with_defaults(8).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    trie.insert(b"k", &val(1), &mut w).unwrap();
    w.release();
    trie.set_readonly();

    let mut r = ReaderToken::new(&trie).unwrap();
    r.acquire();
    assert!(trie.gc());
    // an unlinked reader does not pin the horizon
    assert!(trie.min_age() > r.verseq());
    assert!(r.lookup(b"k"));
    r.release();
}

#[test]
fn tls_tokens_are_cached_per_thread() {
    let trie = Patricia::with_defaults(8).unwrap();
    {
        let mut w = trie.tls_writer_token().unwrap();
        assert!(!w.is_acquired());
        w.acquire();
        assert!(trie.insert(b"tls", &val(3), &mut w).unwrap());
    }
    let first_stamp;
    {
        let mut r = trie.acquire_tls_reader_token().unwrap();
        assert!(r.is_acquired());
        assert!(trie.lookup(b"tls", &mut r));
        assert_eq!(r.value_of::<u64>(), Some(3));
        first_stamp = r.verseq();
    }
    {
        let r = trie.acquire_tls_reader_token().unwrap();
        // same cached token, re-acquired with a newer stamp
        assert!(r.verseq() > first_stamp);
        // a second guard on the same thread gets its own token
        let r2 = trie.acquire_tls_reader_token().unwrap();
        assert!(r2.verseq() > r.verseq());
    }
    let w = trie.tls_writer_token().unwrap();
    assert!(!w.is_acquired());

    std::thread::scope(|s| {
        s.spawn(|| {
            let r = trie.acquire_tls_reader_token().unwrap();
            assert!(r.is_acquired());
        });
    });
}

#[test]
fn iterator_update_reseeks() {
    let trie = Patricia::create(8, 1 << 16, ConcurrentLevel::SingleThreadShared).unwrap();
    let mut w = WriterToken::new(&trie).unwrap();
    w.acquire();
    for k in [&b"b"[..], b"d", b"f"] {
        trie.insert(k, &val(0), &mut w).unwrap();
    }
    let mut it = trie.new_iter().unwrap();
    assert_eq!(it.kind(), TokenKind::Iterator);
    assert!(it.seek_lower_bound(b"d"));
    let stamp = it.verseq();

    // mutate while the iterator is positioned
    trie.insert(b"e", &val(1), &mut w).unwrap();
    trie.insert(b"c", &val(1), &mut w).unwrap();
    w.release();

    it.update();
    assert!(it.verseq() > stamp);
    assert_eq!(it.word(), b"d");
    assert!(it.incr());
    assert_eq!(it.word(), b"e");
    assert!(it.decr());
    assert!(it.decr());
    assert_eq!(it.word(), b"c");

    it.token_detach_iter();
    assert!(!it.is_valid());
    assert!(it.word().is_empty());
    it.dispose();
}
