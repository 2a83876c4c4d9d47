
use rowmap::{ErrorKind, Value};

use crate::setup::{Membership, User, cached_mapper, mapper, membership, store_count, user};

fn cached_user(mapper: &rowmap::Mapper, key: &str) -> Option<User> {
    mapper
        .cache()
        .map::<User>("users")
        .unwrap()
        .read(key, |_, u| u.clone())
}

#[test]
fn users_scenario() {
    let mapper = cached_mapper();

    let mut a = user("a", 0);
    mapper.table::<User>("users").insert(&mut a).unwrap();
    assert_eq!(1, a.id);
    let cached = cached_user(&mapper, "1").unwrap();
    assert_eq!(1, cached.id);
    assert_eq!("a", cached.name);

    mapper
        .table::<User>("users")
        .filter_eq("id", 1)
        .update_fields([("name", Value::from("b"))])
        .unwrap();
    let cached = cached_user(&mapper, "1").unwrap();
    assert_eq!(1, cached.id);
    assert_eq!("b", cached.name);

    mapper
        .table::<User>("users")
        .filter_primary_key([1])
        .delete()
        .unwrap();
    assert!(cached_user(&mapper, "1").is_none());
    assert_eq!(0, store_count(&mapper, "users"));

    let err = mapper
        .table::<User>("users")
        .filter_primary_key([1])
        .one()
        .unwrap_err();
    assert!(err.is_no_rows());
}

#[test]
fn insert_ignore_is_idempotent() {
    let mapper = cached_mapper();

    let first = mapper
        .table::<Membership>("memberships")
        .insert_ignore(&mut membership(7, 1, "member"))
        .unwrap();
    assert_ne!(0, first);

    let mut again = membership(7, 1, "owner");
    let second = mapper
        .table::<Membership>("memberships")
        .insert_ignore(&mut again)
        .unwrap();
    assert_eq!(0, second);

    assert_eq!(1, store_count(&mapper, "memberships"));
    let map = mapper.cache().map::<Membership>("memberships").unwrap();
    assert_eq!(1, map.len());
    assert_eq!(Some("member".to_string()), map.read("7-1", |_, m| m.role.clone()));
}

#[test]
fn cache_and_store_counts_agree() {
    let mapper = cached_mapper();
    for i in 0..10 {
        mapper
            .table::<User>("users")
            .insert(&mut user(&format!("u{i}"), i))
            .unwrap();
    }
    mapper
        .table::<User>("users")
        .filter("age>=?", [Value::Int(7)])
        .delete()
        .unwrap();

    let cached = mapper.table::<User>("users").count().unwrap();
    assert_eq!(7, cached);
    assert_eq!(store_count(&mapper, "users"), cached);

    let mut ages: Vec<_> = mapper
        .table::<User>("users")
        .cached_all()
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|u| u.age)
        .collect();
    ages.sort();
    assert_eq!((0..7).collect::<Vec<_>>(), ages);
}

#[test]
fn primary_key_reads_come_from_cache() {
    let mapper = cached_mapper();

    // Written behind the mapper's back, so the cache doesn't know about it.
    mapper
        .exec("INSERT INTO users (id, name) VALUES (?, ?)", &[Value::Int(5), Value::from("hidden")])
        .unwrap();

    let err = mapper
        .table::<User>("users")
        .filter_primary_key([5])
        .one()
        .unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());

    // Filtered reads still go to the store.
    let found: User = mapper.table("users").filter_eq("id", 5).one().unwrap();
    assert_eq!("hidden", found.name);

    mapper.table::<User>("users").load_cache().unwrap();
    let found: User = mapper.table("users").filter_primary_key([5]).one().unwrap();
    assert_eq!("hidden", found.name);
}

#[test]
fn enabling_cache_loads_existing_rows() {
    let mapper = mapper();
    mapper.bind::<User>("users", true).unwrap();
    for name in ["a", "b", "c"] {
        mapper.table::<User>("users").insert(&mut user(name, 1)).unwrap();
    }
    assert!(mapper.table::<User>("users").cached_all().unwrap().is_none());

    mapper.enable_cache(true).unwrap();
    assert_eq!(3, mapper.table::<User>("users").cached_all().unwrap().unwrap().len());
    assert_eq!("b", cached_user(&mapper, "2").unwrap().name);

    // Binding another table afterwards loads it right away.
    mapper
        .exec("INSERT INTO memberships (user_id, group_id) VALUES (1, 1)", &[])
        .unwrap();
    mapper.bind::<Membership>("memberships", true).unwrap();
    assert_eq!(1, mapper.table::<Membership>("memberships").count().unwrap());
}

#[test]
fn update_fields_patches_every_matching_entry() {
    let mapper = cached_mapper();
    for (name, age) in [("a", 10), ("b", 10), ("c", 20)] {
        mapper.table::<User>("users").insert(&mut user(name, age)).unwrap();
    }

    let updated = mapper
        .table::<User>("users")
        .filter_eq("age", 10)
        .set("created_by", "batch")
        .update_fields([("age", Value::Int(11))])
        .unwrap();
    assert_eq!(2, updated);

    for key in ["1", "2"] {
        let cached = cached_user(&mapper, key).unwrap();
        assert_eq!(11, cached.age);
        assert_eq!("batch", cached.audit.created_by);
    }
    assert_eq!(20, cached_user(&mapper, "3").unwrap().age);
}

#[test]
fn update_by_record_overwrites_cache() {
    let mapper = cached_mapper();
    let mut a = user("a", 1);
    mapper.table::<User>("users").insert(&mut a).unwrap();

    // No row has id 42, the cache entry is written anyway.
    let ghost = User {
        id: 42,
        ..user("ghost", 1)
    };
    assert_eq!(0, mapper.table::<User>("users").update(&ghost).unwrap());
    assert_eq!("ghost", cached_user(&mapper, "42").unwrap().name);

    a.age = 2;
    mapper.table::<User>("users").update(&a).unwrap();
    assert_eq!(2, cached_user(&mapper, "1").unwrap().age);
}

#[test]
fn unfiltered_delete_reloads_and_truncate_empties() {
    let mapper = cached_mapper();
    for name in ["a", "b"] {
        mapper.table::<User>("users").insert(&mut user(name, 1)).unwrap();
    }

    assert_eq!(2, mapper.table::<User>("users").delete().unwrap());
    assert_eq!(0, mapper.table::<User>("users").count().unwrap());

    mapper.table::<User>("users").insert(&mut user("c", 1)).unwrap();
    assert_eq!(1, mapper.table::<User>("users").count().unwrap());
    mapper.table::<User>("users").truncate().unwrap();
    assert_eq!(0, mapper.table::<User>("users").count().unwrap());
    assert_eq!(0, store_count(&mapper, "users"));
}

#[test]
fn read_only_leaves_cache_alone() {
    let mapper = cached_mapper();
    let mut a = user("a", 1);
    mapper.table::<User>("users").insert(&mut a).unwrap();

    mapper.set_read_only(true);
    mapper.table::<User>("users").insert(&mut user("b", 1)).unwrap();
    mapper
        .table::<User>("users")
        .filter_primary_key([a.id])
        .update_fields([("name", Value::from("z"))])
        .unwrap();
    mapper.table::<User>("users").filter_primary_key([a.id]).delete().unwrap();
    mapper.table::<User>("users").truncate().unwrap();

    assert_eq!(1, mapper.table::<User>("users").count().unwrap());
    assert_eq!("a", cached_user(&mapper, "1").unwrap().name);
    assert_eq!(1, store_count(&mapper, "users"));
}

#[test]
fn disabling_cache_bypasses_it() {
    let mapper = cached_mapper();
    mapper.table::<User>("users").insert(&mut user("a", 1)).unwrap();
    mapper.enable_cache(false).unwrap();

    mapper.table::<User>("users").insert(&mut user("b", 1)).unwrap();
    assert_eq!(2, mapper.table::<User>("users").count().unwrap());
    assert!(mapper.table::<User>("users").cached_all().unwrap().is_none());

    mapper.enable_cache(true).unwrap();
    assert_eq!(2, mapper.table::<User>("users").cached_all().unwrap().unwrap().len());
}
