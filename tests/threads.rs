mod support;

use assert_matches::assert_matches;
use sheet_chat::error::ThreadError;
use sheet_chat::model::Role;
use sheet_chat::threads::ThreadStore;
use std::thread::sleep;
use std::time::Duration;
use support::TestWorkspace;

fn store() -> ThreadStore {
    ThreadStore::open_in_memory().expect("in-memory store")
}

#[test]
fn thread_crud() {
    let store = store();

    let created = store.create_thread("  Budget review ").expect("create");
    assert_eq!(created.title, "Budget review");
    assert_eq!(created.created_at, created.updated_at);
    assert_eq!(store.get_thread(&created.id).unwrap(), created);

    sleep(Duration::from_millis(2));
    let renamed = store.update_thread(&created.id, "Q3 budget").expect("rename");
    assert_eq!(renamed.title, "Q3 budget");
    assert_eq!(renamed.created_at, created.created_at);
    assert!(renamed.updated_at > created.updated_at);

    store.delete_thread(&created.id).expect("delete");
    assert_matches!(store.get_thread(&created.id), Err(ThreadError::NotFound(ref id)) if *id == created.id);
    assert_eq!(store.thread_count().unwrap(), 0);
}

#[test]
fn blank_titles_and_messages_are_rejected() {
    let store = store();
    assert_matches!(store.create_thread("   "), Err(ThreadError::InvalidTitle));

    let thread = store.create_thread("Notes").unwrap();
    assert_matches!(store.update_thread(&thread.id, ""), Err(ThreadError::InvalidTitle));
    assert_matches!(
        store.append_message(&thread.id, Role::User, " \n"),
        Err(ThreadError::EmptyMessage)
    );
    assert!(store.list_messages(&thread.id).unwrap().is_empty());
}

#[test]
fn unknown_threads_are_not_found() {
    let store = store();
    assert_matches!(store.update_thread("missing", "x"), Err(ThreadError::NotFound(_)));
    assert_matches!(store.delete_thread("missing"), Err(ThreadError::NotFound(_)));
    assert_matches!(store.list_messages("missing"), Err(ThreadError::NotFound(_)));
    assert_matches!(
        store.append_message("missing", Role::User, "hello"),
        Err(ThreadError::NotFound(_))
    );
}

#[test]
fn messages_list_oldest_first() {
    let store = store();
    let thread = store.create_thread("Chat").unwrap();

    store
        .append_message(&thread.id, Role::User, "Set B2 to 999")
        .unwrap();
    store
        .append_message(&thread.id, Role::Assistant, "Update Sheet1!B2 from 100 to 999?")
        .unwrap();
    store.append_message(&thread.id, Role::User, "yes").unwrap();

    let messages = store.list_messages(&thread.id).unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["Set B2 to 999", "Update Sheet1!B2 from 100 to 999?", "yes"]
    );
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(messages.iter().all(|m| m.thread_id == thread.id));
}

#[test]
fn new_messages_move_a_thread_to_the_top() {
    let store = store();
    let older = store.create_thread("First").unwrap();
    sleep(Duration::from_millis(2));
    let newer = store.create_thread("Second").unwrap();

    let ids: Vec<_> = store.list_threads().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);

    sleep(Duration::from_millis(2));
    store.append_message(&older.id, Role::User, "bump").unwrap();
    let ids: Vec<_> = store.list_threads().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![older.id, newer.id]);
}

#[test]
fn deleting_a_thread_removes_its_messages() {
    let workspace = TestWorkspace::new();
    let path = workspace.path("chat.db");
    let store = ThreadStore::open_path(&path).unwrap();
    let thread = store.create_thread("Doomed").unwrap();
    store.append_message(&thread.id, Role::User, "one").unwrap();
    store.append_message(&thread.id, Role::User, "two").unwrap();
    store.delete_thread(&thread.id).unwrap();
    drop(store);

    let conn = rusqlite::Connection::open(&path).unwrap();
    let orphans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
            [&thread.id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(orphans, 0);
}

#[test]
fn open_path_creates_parent_dirs_and_persists() {
    let workspace = TestWorkspace::new();
    let path = workspace.path("data/nested/chat.db");

    let id = {
        let store = ThreadStore::open_path(&path).expect("open");
        store.create_thread("Persisted").unwrap().id
    };
    assert!(path.exists());

    let reopened = ThreadStore::open_path(&path).expect("reopen");
    assert_eq!(reopened.get_thread(&id).unwrap().title, "Persisted");
    assert_eq!(reopened.thread_count().unwrap(), 1);
}
