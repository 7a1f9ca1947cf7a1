// Table semantics: hybrid parts, Brent insertion, traversal, statistical
// length, stats slots, the sorted view.

use crate::gc::StringPool;
use crate::value::{StatData, Table, TableError, Value};

fn pool() -> StringPool {
    StringPool::new(0x9e37_79b9)
}

#[test]
fn test_set_get_delete() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();

    d.set(&sp, &Value::Number(1), Value::Number(100)).unwrap();
    d.set(&sp, &Value::Number(7), Value::Number(700)).unwrap();
    assert_eq!(d.get(&sp, &Value::Number(1)).as_number(), Some(100));
    assert_eq!(d.get(&sp, &Value::Number(7)).as_number(), Some(700));

    // update in place
    d.set(&sp, &Value::Number(7), Value::Number(701)).unwrap();
    assert_eq!(d.get(&sp, &Value::Number(7)).as_number(), Some(701));

    // storing nil deletes
    d.set(&sp, &Value::Number(7), Value::Nil).unwrap();
    assert!(d.get(&sp, &Value::Number(7)).is_nil());

    // storing nil to a missing key is a no-op
    d.set(&sp, &Value::Number(9999), Value::Nil).unwrap();
    assert!(d.get(&sp, &Value::Number(9999)).is_nil());
    assert_eq!(d.length(), 1);
}

#[test]
fn test_string_keys() {
    let mut sp = pool();
    let foo = Value::Str(sp.new_str("foo").unwrap());
    let bar = Value::Str(sp.new_str("bar").unwrap());
    let long = Value::Str(sp.new_str(&"x".repeat(120)).unwrap());
    let long2 = Value::Str(sp.new_long(&"x".repeat(120)).unwrap());

    let t = Table::new();
    let mut d = t.lock();
    d.set(&sp, &foo, Value::Number(1)).unwrap();
    d.set(&sp, &bar, Value::Number(2)).unwrap();
    d.set(&sp, &long, Value::Number(3)).unwrap();

    assert_eq!(d.get(&sp, &foo).as_number(), Some(1));
    assert_eq!(d.get(&sp, &bar).as_number(), Some(2));
    // long strings compare by bytes, not identity
    assert_eq!(d.get(&sp, &long2).as_number(), Some(3));

    // interned key through a second lookup id
    let foo2 = Value::Str(sp.new_str("foo").unwrap());
    assert_eq!(d.get(&sp, &foo2).as_number(), Some(1));
}

#[test]
fn test_nil_and_event_keys_rejected() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    assert_eq!(
        d.set(&sp, &Value::Nil, Value::Number(1)),
        Err(TableError::NilKey)
    );
    assert_eq!(
        d.set(&sp, &Value::Event, Value::Number(1)),
        Err(TableError::EventEscape)
    );
    assert_eq!(
        d.set(&sp, &Value::Number(1), Value::Event),
        Err(TableError::EventEscape)
    );
}

#[test]
fn test_traversal_visits_every_key_once() {
    let mut sp = pool();
    let t = Table::new();
    let mut d = t.lock();

    let mut expect = Vec::new();
    for i in 1..=8 {
        d.set(&sp, &Value::Number(i), Value::Number(i * 10)).unwrap();
        expect.push(i * 10);
    }
    for name in ["alpha", "beta", "gamma"] {
        let key = Value::Str(sp.new_str(name).unwrap());
        d.set(&sp, &key, Value::Number(1000)).unwrap();
        expect.push(1000);
    }

    let mut seen = Vec::new();
    let mut key = Value::Nil;
    while let Some((k, v)) = d.next(&sp, &key).unwrap() {
        seen.push(v.as_number().unwrap());
        key = k;
    }
    seen.sort();
    expect.sort();
    assert_eq!(seen, expect);
}

#[test]
fn test_next_with_unknown_key_fails() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    d.set(&sp, &Value::Number(1), Value::Number(1)).unwrap();
    assert!(matches!(
        d.next(&sp, &Value::Number(55)),
        Err(TableError::InvalidNext)
    ));
}

#[test]
fn test_collision_heavy_inserts() {
    let mut sp = pool();
    let t = Table::new();
    let mut d = t.lock();

    // mixed keys force chains, displacement and several rehashes
    for i in 0..500i64 {
        d.set(&sp, &Value::Number(i * 7919), Value::Number(i)).unwrap();
    }
    for i in 0..200 {
        let key = Value::Str(sp.new_str(&format!("key-{}", i)).unwrap());
        d.set(&sp, &key, Value::Number(10_000 + i)).unwrap();
    }
    for i in 0..500i64 {
        assert_eq!(
            d.get(&sp, &Value::Number(i * 7919)).as_number(),
            Some(i),
            "lost integer key {}",
            i
        );
    }
    for i in 0..200 {
        let key = Value::Str(sp.new_str(&format!("key-{}", i)).unwrap());
        assert_eq!(d.get(&sp, &key).as_number(), Some(10_000 + i));
    }
    assert_eq!(d.length(), 700);

    // delete half the strings and reinsert under new values
    for i in 0..100 {
        let key = Value::Str(sp.new_str(&format!("key-{}", i)).unwrap());
        d.set(&sp, &key, Value::Nil).unwrap();
    }
    assert_eq!(d.length(), 600);
    for i in 0..100 {
        let key = Value::Str(sp.new_str(&format!("key-{}", i)).unwrap());
        d.set(&sp, &key, Value::Number(i)).unwrap();
        assert_eq!(d.get(&sp, &key).as_number(), Some(i));
    }
    assert_eq!(d.length(), 700);
}

#[test]
fn test_dense_integer_keys_reach_array_part() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    for i in 1..=64 {
        d.set(&sp, &Value::Number(i), Value::Number(i)).unwrap();
    }
    assert!(d.array_size() > 0, "rehash never moved keys to the array");
    for i in 1..=64 {
        assert_eq!(d.get_int(i).as_number(), Some(i));
    }
}

#[test]
fn test_resize_leaves_lastfree_at_node_count() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    d.resize(&sp, 0, 8).unwrap();
    assert_eq!(d.hash_size(), 8);
    assert_eq!(d.lastfree(), 8);
}

#[test]
fn test_hash_part_overflow() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    assert_eq!(
        d.resize(&sp, 0, (1 << 30) + 1),
        Err(TableError::Overflow)
    );
    // well under the limit: fine
    d.resize(&sp, 0, 1 << 12).unwrap();
    assert_eq!(d.hash_size(), 1 << 12);
}

#[test]
fn test_length_counts_present_entries() {
    let mut sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    // a hole in the array part does not end the count
    d.set(&sp, &Value::Number(1), Value::Number(1)).unwrap();
    d.set(&sp, &Value::Number(2), Value::Number(2)).unwrap();
    d.set(&sp, &Value::Number(4), Value::Number(4)).unwrap();
    let key = Value::Str(sp.new_str("k").unwrap());
    d.set(&sp, &key, Value::Number(5)).unwrap();
    assert_eq!(d.length(), 4);
    d.set(&sp, &Value::Number(2), Value::Nil).unwrap();
    assert_eq!(d.length(), 3);
}

#[test]
fn test_atomic_inc() {
    let mut sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    let key = Value::Str(sp.new_str("sh").unwrap());

    // missing slot seeds with the increment
    d.atomic_inc(&sp, &key, 1).unwrap();
    assert_eq!(d.get(&sp, &key).as_number(), Some(1));
    d.atomic_inc(&sp, &key, 1).unwrap();
    d.atomic_inc(&sp, &key, 5).unwrap();
    assert_eq!(d.get(&sp, &key).as_number(), Some(7));

    // +1 then -1 leaves the slot numerically unchanged
    d.atomic_inc(&sp, &key, 1).unwrap();
    d.atomic_inc(&sp, &key, -1).unwrap();
    assert_eq!(d.get(&sp, &key).as_number(), Some(7));
}

#[test]
fn test_stat_slots() {
    let mut sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    d.with_stats = true;
    let key = Value::Str(sp.new_str("lat").unwrap());

    d.stat_add(&sp, &key, 5).unwrap();
    d.stat_add(&sp, &key, 7).unwrap();
    d.stat_add(&sp, &key, 3).unwrap();
    let sd = d.stat_get(&sp, &key).unwrap();
    assert_eq!(
        sd,
        StatData {
            count: 3,
            sum: 15,
            min: 3,
            max: 7
        }
    );

    // value slot mirrors the accumulator
    assert!(matches!(d.get(&sp, &key), Value::Stat(s) if s == sd));

    // merging another accumulator folds counts and extrema
    let merged = d
        .stat_merge(
            &sp,
            &key,
            &StatData {
                count: 2,
                sum: 20,
                min: 2,
                max: 18,
            },
        )
        .unwrap();
    assert_eq!(
        merged,
        StatData {
            count: 5,
            sum: 35,
            min: 2,
            max: 18
        }
    );

    // overwrite puts an exact copy in place
    let put = StatData {
        count: 1,
        sum: 9,
        min: 9,
        max: 9,
    };
    d.stat_put(&sp, &key, put).unwrap();
    assert_eq!(d.stat_get(&sp, &key), Some(put));
}

#[test]
fn test_sorted_view_chain() {
    let mut sp = pool();
    let t = Table::new();
    let mut d = t.lock();

    let keys: Vec<Value> = ["a", "b", "c"]
        .iter()
        .map(|s| Value::Str(sp.new_str(s).unwrap()))
        .collect();
    d.set(&sp, &keys[0], Value::Number(30)).unwrap();
    d.set(&sp, &keys[1], Value::Number(10)).unwrap();
    d.set(&sp, &keys[2], Value::Number(20)).unwrap();

    // install ascending by value, the default ordering callers produce
    let mut ordered = d.entries();
    ordered.sort_by_key(|(_, v)| v.as_number().unwrap());
    d.install_sorted(&ordered);
    assert!(d.has_sorted_view());

    let mut walked = Vec::new();
    let mut key = Value::Nil;
    while let Some((k, v)) = d.sort_next(&sp, &key) {
        walked.push(v.as_number().unwrap());
        key = k;
    }
    assert_eq!(walked, vec![10, 20, 30]);

    // a cleared table forgets its sorted view
    d.clear();
    assert!(!d.has_sorted_view());
    assert_eq!(d.length(), 0);
}

#[test]
fn test_clear_keeps_capacity() {
    let sp = pool();
    let t = Table::new();
    let mut d = t.lock();
    d.resize(&sp, 8, 16).unwrap();
    for i in 1..=8 {
        d.set(&sp, &Value::Number(i), Value::Number(i)).unwrap();
    }
    d.clear();
    assert_eq!(d.length(), 0);
    assert_eq!(d.hash_size(), 16);
    assert_eq!(d.array_size(), 8);
    assert_eq!(d.lastfree(), 16);
}
