mod common;

use common::{as_root, open, open_counting};
use serde_json::json;
use std::cell::Cell;
use strata::prelude::*;

fn shop() -> Registry {
    let mut r = Registry::new();
    r.new_model("Partner")
        .unwrap()
        .add_fields([
            Field::char("Name").required(),
            Field::integer("Age"),
            Field::float("Rating"),
            Field::boolean("Active"),
            Field::date("Birthday"),
            Field::json("Extra"),
            Field::many2one("Parent", "Partner"),
            Field::one2many("Children", "Partner", "Parent"),
        ])
        .unwrap();
    r.new_model("Post")
        .unwrap()
        .add_fields([
            Field::char("Title"),
            Field::float("Score"),
            Field::many2one("Author", "Partner"),
            Field::char("AuthorName").related("Author.Name"),
            Field::many2many("Tags", "Tag"),
        ])
        .unwrap();
    r.new_model("Tag")
        .unwrap()
        .add_fields([Field::char("Name"), Field::many2many("Posts", "Post")])
        .unwrap();
    r
}

fn sorted(mut ids: Vec<i64>) -> Vec<i64> {
    ids.sort_unstable();
    ids
}

#[test]
fn created_values_read_back() {
    let db = open(shop());
    let id = as_root(&db, |env| {
        let partners = env.pool("Partner");
        let parent = partners.create(fields! { "Name" => "Acme" })?;
        partners
            .create(fields! {
                "Name" => "Ann",
                "Age" => 31,
                "Rating" => 4.5,
                "Active" => true,
                "Birthday" => Value::date(1990, 5, 17),
                "Extra" => json!({"vip": true, "tags": ["a", "b"]}),
                "Parent" => &parent,
            })?
            .ensure_one()
    });

    as_root(&db, |env| {
        let ann = env.pool("Partner").with_ids(&[id]);
        assert_eq!(ann.get("Name")?, Value::from("Ann"));
        assert_eq!(ann.get("Age")?, Value::Integer(31));
        assert_eq!(ann.get("Rating")?, Value::Float(4.5));
        assert_eq!(ann.get("Active")?, Value::Bool(true));
        assert_eq!(ann.get("Birthday")?, Value::date(1990, 5, 17));
        assert_eq!(ann.get("Extra")?, Value::Json(json!({"vip": true, "tags": ["a", "b"]})));
        assert_eq!(ann.get_records("Parent")?.get_as::<String>("Name")?, "Acme");
        assert!(!ann.get("CreateDate")?.is_null());

        let parent = ann.get_records("Parent")?;
        assert_eq!(parent.get_records("Children")?.ids()?, vec![id]);
        Ok(())
    });
}

#[test]
fn unset_fields_read_as_zero_values() {
    let db = open(shop());
    as_root(&db, |env| {
        let bob = env.pool("Partner").create(fields! { "Name" => "Bob" })?;
        assert_eq!(bob.get("Active")?, Value::Bool(false));
        assert!(bob.get("Age")?.is_null());
        assert_eq!(bob.get("Children")?, Value::Refs(vec![]));

        let none = env.pool("Partner").search(field("Name").equals("nobody"));
        assert!(none.is_empty()?);
        assert!(none.get("Name")?.is_null());
        Ok(())
    });
}

#[test]
fn reads_follow_writes() {
    for patch in [false, true] {
        let db = open(shop()).with_config(Config::default().patch_cache_on_write(patch));
        let id = as_root(&db, |env| {
            let ann = env.pool("Partner").create(fields! { "Name" => "Ann", "Age" => 30 })?;
            ann.load(&["Name", "Age"])?;
            let id = ann.ensure_one()?;
            assert_eq!(env.cache().get("Partner", id, "Name"), Some(&Value::from("Ann")));

            ann.write(fields! { "Name" => "Anna" })?;
            assert_eq!(ann.get("Name")?, Value::from("Anna"));
            ann.set("Age", 31)?;
            assert_eq!(ann.get("Age")?, Value::Integer(31));
            Ok(id)
        });

        let (name, age) = as_root(&db, |env| {
            let ann = env.pool("Partner").with_ids(&[id]);
            Ok((ann.get_as::<String>("Name")?, ann.get_as::<i64>("Age")?))
        });
        assert_eq!(name, "Anna");
        assert_eq!(age, 31);
    }
}

#[test]
fn unlink_removes_records() {
    let db = open(shop());
    as_root(&db, |env| {
        let partners = env.pool("Partner");
        for name in ["a", "b", "c"] {
            partners.create(fields! { "Name" => name })?;
        }
        let doomed = partners.search(field("Name").in_(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(doomed.unlink()?, 2);
        assert_eq!(partners.search_all().search_count()?, 1);
        assert_eq!(partners.search_all().get_as::<String>("Name")?, "c");
        Ok(())
    });
}

#[test]
fn many2many_is_visible_from_both_sides() {
    let db = open(shop());
    as_root(&db, |env| {
        let tags = env.pool("Tag");
        let rust = tags.create(fields! { "Name" => "rust" })?;
        let sql = tags.create(fields! { "Name" => "sql" })?;
        let both = rust.union(&sql)?;
        let post = env
            .pool("Post")
            .create(fields! { "Title" => "orm", "Tags" => &both })?;

        assert_eq!(sorted(post.get_records("Tags")?.ids()?), sorted(both.ids()?));
        assert_eq!(rust.get_records("Posts")?.ids()?, post.ids()?);

        post.write(fields! { "Tags" => &sql })?;
        assert_eq!(post.get_records("Tags")?.ids()?, sql.ids()?);
        assert!(rust.get_records("Posts")?.is_empty()?);

        sql.unlink()?;
        assert!(post.get_records("Tags")?.is_empty()?);
        Ok(())
    });
}

#[test]
fn many2many_reads_use_the_link_cache() {
    let (db, conn) = open_counting(shop());
    as_root(&db, |env| {
        let tags = env.pool("Tag");
        let rust = tags.create(fields! { "Name" => "rust" })?;
        let sql = tags.create(fields! { "Name" => "sql" })?;
        let post = env
            .pool("Post")
            .create(fields! { "Title" => "orm", "Tags" => &rust.union(&sql)? })?;

        sql.unlink()?;
        let before = conn.queries();
        assert_eq!(post.get_records("Tags")?.ids()?, rust.ids()?);
        assert_eq!(conn.queries(), before);
        Ok(())
    });
}

#[test]
fn explicit_link_rows_show_in_many2many_reads() {
    let mut r = Registry::new();
    r.new_model("Person").unwrap().add_field(Field::char("Name")).unwrap();
    r.new_model("Club")
        .unwrap()
        .add_fields([
            Field::char("Name"),
            Field::many2many("Members", "Person").link("Membership", "Club", "Person"),
        ])
        .unwrap();
    r.new_model("Membership")
        .unwrap()
        .add_fields([
            Field::many2one("Club", "Club").required(),
            Field::many2one("Person", "Person").required(),
        ])
        .unwrap();
    let db = open(r);

    as_root(&db, |env| {
        let people = env.pool("Person");
        let ann = people.create(fields! { "Name" => "ann" })?;
        let bob = people.create(fields! { "Name" => "bob" })?;
        let club = env
            .pool("Club")
            .create(fields! { "Name" => "chess", "Members" => &ann })?;
        assert_eq!(club.get_records("Members")?.ids()?, ann.ids()?);

        env.pool("Membership")
            .create(fields! { "Club" => &club, "Person" => &bob })?;
        let members = club.get_records("Members")?;
        assert!(members.equals(&ann.union(&bob)?)?);
        Ok(())
    });
}

#[test]
fn one2many_writes_move_the_foreign_key() {
    let db = open(shop());
    as_root(&db, |env| {
        let partners = env.pool("Partner");
        let acme = partners.create(fields! { "Name" => "Acme" })?;
        let ann = partners.create(fields! { "Name" => "Ann" })?;
        let bob = partners.create(fields! { "Name" => "Bob" })?;

        acme.write(fields! { "Children" => &ann.union(&bob)? })?;
        assert_eq!(bob.get("Parent")?, Value::Ref(acme.ensure_one()?));

        acme.write(fields! { "Children" => &ann })?;
        assert!(bob.get("Parent")?.is_null());
        assert_eq!(acme.get_records("Children")?.ids()?, ann.ids()?);
        Ok(())
    });
}

#[test]
fn child_of_walks_the_parent_chain() {
    let db = open(shop());
    as_root(&db, |env| {
        let partners = env.pool("Partner");
        let root = partners.create(fields! { "Name" => "root" })?;
        let mid = partners.create(fields! { "Name" => "mid", "Parent" => &root })?;
        let leaf = partners.create(fields! { "Name" => "leaf", "Parent" => &mid })?;
        partners.create(fields! { "Name" => "other" })?;

        let tree = partners.search(field("ID").child_of(&root));
        let expected = root.union(&mid)?.union(&leaf)?;
        assert!(tree.equals(&expected)?);

        let below_mid = partners.search(field("ID").child_of(&mid));
        assert_eq!(sorted(below_mid.ids()?), sorted(mid.union(&leaf)?.ids()?));
        Ok(())
    });
}

#[test]
fn ordering_and_paging() {
    let db = open(shop());
    as_root(&db, |env| {
        let partners = env.pool("Partner");
        for (name, age) in [("d", 4), ("b", 2), ("a", 1), ("c", 3), ("e", 5)] {
            partners.create(fields! { "Name" => name, "Age" => age })?;
        }
        let names = |rs: RecordCollection| -> Result<Vec<String>> {
            rs.records()?.iter().map(|r| r.get_as::<String>("Name")).collect()
        };

        let all = partners.search_all();
        assert_eq!(names(all.order_by(&["Name"]))?, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(names(all.order_by(&["Age desc"]).limit(2))?, vec!["e", "d"]);
        assert_eq!(names(all.order_by(&["Name"]).limit(2).offset(1))?, vec!["b", "c"]);
        assert_eq!(all.search_count()?, 5);
        assert_eq!(all.limit(2).search_count()?, 5);
        assert_eq!(all.limit(2).len()?, 2);
        Ok(())
    });
}

#[test]
fn set_operations() {
    let db = open(shop());
    as_root(&db, |env| {
        let partners = env.pool("Partner");
        let a = partners.create(fields! { "Name" => "a", "Age" => 10 })?;
        let b = partners.create(fields! { "Name" => "b", "Age" => 20 })?;
        let c = partners.create(fields! { "Name" => "c", "Age" => 30 })?;

        let young = partners.search(field("Age").lower(25));
        let old = partners.search(field("Age").greater(15));
        assert!(young.intersect(&old)?.equals(&b)?);
        assert!(young.subtract(&old)?.equals(&a)?);
        assert!(young.union(&old)?.equals(&a.union(&b)?.union(&c)?)?);
        assert!(!young.equals(&old)?);
        assert!(!a.equals(&env.pool("Tag"))?);
        assert_eq!(a.ensure_one()?, a.ids()?[0]);
        Ok(())
    });
}

#[test]
#[should_panic(expected = "expected a singleton of `Partner`, got 2 records")]
fn ensure_one_rejects_several_records() {
    let db = open(shop());
    let _ = db.execute_in_new_environment(SUPERUSER_ID, |env| {
        let partners = env.pool("Partner");
        partners.create(fields! { "Name" => "a" })?;
        partners.create(fields! { "Name" => "b" })?;
        partners.search_all().ensure_one()
    });
}

#[test]
fn group_by_aggregates() {
    let db = open(shop());
    let (ann, bob) = as_root(&db, |env| {
        let partners = env.pool("Partner");
        let ann = partners.create(fields! { "Name" => "Ann" })?;
        let bob = partners.create(fields! { "Name" => "Bob" })?;
        let posts = env.pool("Post");
        for (author, score) in [(&ann, 1.5), (&bob, 2.0), (&ann, 3.0)] {
            posts.create(fields! { "Title" => "p", "Author" => author, "Score" => score })?;
        }
        Ok((ann.ensure_one()?, bob.ensure_one()?))
    });

    let rows = as_root(&db, |env| {
        env.pool("Post")
            .search_all()
            .group_by(&["Author"])
            .aggregates(&["Score"])
    });
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].values["Author"], Value::Ref(ann));
    assert_eq!(rows[0].aggregates["Score"], Value::Float(4.5));
    assert_eq!(rows[0].count, 2);
    assert_eq!(rows[1].values["Author"], Value::Ref(bob));
    assert_eq!(rows[1].aggregates["Score"], Value::Float(2.0));
    assert_eq!(rows[1].count, 1);
}

#[test]
fn grouped_reads_count_each_record_once() {
    let db = open(shop());
    let ann = as_root(&db, |env| {
        let ann = env.pool("Partner").create(fields! { "Name" => "Ann" })?;
        let tags = env.pool("Tag");
        let a = tags.create(fields! { "Name" => "a" })?;
        let b = tags.create(fields! { "Name" => "b" })?;
        let posts = env.pool("Post");
        posts.create(fields! { "Title" => "both", "Author" => &ann, "Score" => 2.0, "Tags" => &a.union(&b)? })?;
        posts.create(fields! { "Title" => "one", "Author" => &ann, "Score" => 1.0, "Tags" => &a })?;
        ann.ensure_one()
    });

    let rows = as_root(&db, |env| {
        env.pool("Post")
            .search(field("Tags.Name").in_(vec![Value::from("a"), Value::from("b")]))
            .group_by(&["Author"])
            .aggregates(&["Score"])
    });
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values["Author"], Value::Ref(ann));
    assert_eq!(rows[0].count, 2);
    assert_eq!(rows[0].aggregates["Score"], Value::Float(3.0));
}

#[test]
fn loads_skip_cached_fields() {
    let (db, conn) = open_counting(shop());
    as_root(&db, |env| {
        let ann = env
            .pool("Partner")
            .create(fields! { "Name" => "Ann", "Age" => 31 })?;
        ann.load(&["Name", "Age", "Children"])?;

        let before = conn.queries();
        ann.load(&["Name", "Age", "Children"])?;
        assert_eq!(ann.get_as::<String>("Name")?, "Ann");
        assert_eq!(conn.queries(), before);

        env.invalidate_cache();
        ann.load(&["Name"])?;
        assert_eq!(conn.queries(), before + 1);
        ann.load(&["Name"])?;
        assert_eq!(conn.queries(), before + 1);
        ann.load(&["Name", "Age"])?;
        assert_eq!(conn.queries(), before + 2);
        assert_eq!(ann.get_as::<i64>("Age")?, 31);
        assert_eq!(conn.queries(), before + 2);
        Ok(())
    });
}

#[test]
fn related_fields_load_through_joins() {
    let (db, conn) = open_counting(shop());
    as_root(&db, |env| {
        let ann = env.pool("Partner").create(fields! { "Name" => "Ann" })?;
        let post = env
            .pool("Post")
            .create(fields! { "Title" => "p", "Author" => &ann })?;
        let id = post.ensure_one()?;

        env.invalidate_cache();
        let before = conn.queries();
        post.load(&["Title", "AuthorName"])?;
        assert_eq!(conn.queries(), before + 1);
        assert_eq!(env.cache().get("Post", id, "AuthorName"), Some(&Value::from("Ann")));
        assert_eq!(post.get_as::<String>("AuthorName")?, "Ann");
        assert_eq!(conn.queries(), before + 1);

        ann.write(fields! { "Name" => "Anne" })?;
        assert_eq!(post.get_as::<String>("AuthorName")?, "Anne");

        post.write(fields! { "AuthorName" => "Annie" })?;
        assert_eq!(ann.get_as::<String>("Name")?, "Annie");
        assert_eq!(post.get_as::<String>("AuthorName")?, "Annie");

        let orphan = env.pool("Post").create(fields! { "Title" => "q" })?;
        assert!(orphan.get("AuthorName")?.is_null());
        Ok(())
    });
}

thread_local! {
    static TOTALS_COMPUTED: Cell<usize> = const { Cell::new(0) };
}

fn orders() -> Registry {
    let mut r = Registry::new();
    r.new_model("Order")
        .unwrap()
        .add_fields([
            Field::char("Name"),
            Field::one2many("Lines", "Line", "Order"),
            Field::float("Amount").compute("ComputeAmount", ["Lines.Total"]).stored(),
        ])
        .unwrap()
        .add_method("ComputeAmount", |rs: &RecordCollection| -> Result<FieldMap> {
            let mut amount = 0.0;
            for line in rs.get_records("Lines")?.records()? {
                amount += line.get_as::<f64>("Total")?;
            }
            Ok(fields! { "Amount" => amount })
        })
        .unwrap();
    r.new_model("Line")
        .unwrap()
        .add_fields([
            Field::char("Name"),
            Field::float("Qty"),
            Field::float("Price"),
            Field::many2one("Order", "Order"),
            Field::float("Total").compute("ComputeTotal", ["Qty", "Price"]).stored(),
        ])
        .unwrap()
        .add_method("ComputeTotal", |rs: &RecordCollection| -> Result<FieldMap> {
            TOTALS_COMPUTED.with(|n| n.set(n.get() + 1));
            let qty = rs.get("Qty")?.as_f64().unwrap_or_default();
            let price = rs.get("Price")?.as_f64().unwrap_or_default();
            Ok(fields! { "Total" => qty * price })
        })
        .unwrap();
    r
}

#[test]
fn stored_computes_follow_their_dependencies() {
    let db = open(orders());
    let order = as_root(&db, |env| {
        let order = env.pool("Order").create(fields! { "Name" => "SO1" })?;
        assert_eq!(order.get("Amount")?, Value::Float(0.0));

        let lines = env.pool("Line");
        let first = lines.create(fields! { "Order" => &order, "Qty" => 2.0, "Price" => 5.0 })?;
        lines.create(fields! { "Order" => &order, "Qty" => 1.0, "Price" => 2.5 })?;
        assert_eq!(first.get("Total")?, Value::Float(10.0));
        assert_eq!(order.get("Amount")?, Value::Float(12.5));

        first.write(fields! { "Qty" => 3.0 })?;
        assert_eq!(first.get("Total")?, Value::Float(15.0));
        assert_eq!(order.get("Amount")?, Value::Float(17.5));

        first.unlink()?;
        assert_eq!(order.get("Amount")?, Value::Float(2.5));
        order.ensure_one()
    });

    let amount = as_root(&db, |env| env.pool("Order").with_ids(&[order]).get_as::<f64>("Amount"));
    assert_eq!(amount, 2.5);
}

#[test]
fn new_children_update_stored_parent_totals() {
    let db = open(orders());
    let order = as_root(&db, |env| {
        let order = env.pool("Order").create(fields! { "Name" => "SO2" })?;
        env.pool("Line")
            .create(fields! { "Order" => &order, "Qty" => 4.0, "Price" => 0.5 })?;
        order.ensure_one()
    });

    let (amount, total) = as_root(&db, |env| {
        let order = env.pool("Order").with_ids(&[order]);
        let line = order.get_records("Lines")?;
        Ok((order.get_as::<f64>("Amount")?, line.get_as::<f64>("Total")?))
    });
    assert_eq!((amount, total), (2.0, 2.0));
}

#[test]
fn recompute_is_idempotent() {
    let db = open(orders());
    as_root(&db, |env| {
        let line = env
            .pool("Line")
            .create(fields! { "Qty" => 2.0, "Price" => 3.0 })?;
        let before = TOTALS_COMPUTED.with(Cell::get);
        line.write(fields! { "Name" => "renamed" })?;
        assert_eq!(TOTALS_COMPUTED.with(Cell::get), before);

        line.write(fields! { "Qty" => 2.0 })?;
        assert_eq!(line.get("Total")?, Value::Float(6.0));
        line.write(fields! { "Qty" => 2.0 })?;
        assert_eq!(line.get("Total")?, Value::Float(6.0));
        Ok(())
    });
}

#[test]
fn embedded_records_are_created_and_written_through() {
    let mut r = Registry::new();
    r.new_model("Contact")
        .unwrap()
        .add_fields([Field::char("Email"), Field::char("Phone")])
        .unwrap();
    r.new_model("Member")
        .unwrap()
        .add_fields([
            Field::char("Login"),
            Field::one2one("Contact", "Contact").embed(),
        ])
        .unwrap();
    let db = open(r);

    as_root(&db, |env| {
        let member = env
            .pool("Member")
            .create(fields! { "Login" => "ann", "Email" => "ann@example.com" })?;
        let contact = member.get_records("Contact")?;
        assert_eq!(contact.len()?, 1);
        assert_eq!(contact.get_as::<String>("Email")?, "ann@example.com");
        assert_eq!(member.get_as::<String>("Email")?, "ann@example.com");

        member.write(fields! { "Phone" => "555-0100" })?;
        assert_eq!(contact.get_as::<String>("Phone")?, "555-0100");
        assert_eq!(member.get_as::<String>("Phone")?, "555-0100");

        let found = env
            .pool("Member")
            .search(field("Email").equals("ann@example.com"));
        assert!(found.equals(&member)?);
        Ok(())
    });
}
