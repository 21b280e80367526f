use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tasksync_core::error::{SyncError, SyncResult};
use tasksync_core::model::{Account, Backend, RemoteLink, Task, TaskId, TaskList};
use tasksync_core::store::{LocalStore, TaskStore};
use tasksync_core::sync::{Cancellation, RetryPolicy, SyncRequester};
use tasksync_core::TaskMover;
use tasksync_provider_journal::{
    Action, CollectionInfo, DerivedKey, EncryptedEntry, Journal, JournalKeyCache,
    JournalSynchronizer, JournalTransport, SyncEntry, UserInfo,
};

const INBOX: &str = "inbox-journal";
const WORK: &str = "work-journal";

fn derived() -> DerivedKey {
    DerivedKey::from_bytes([42u8; 32])
}

#[derive(Default)]
struct Counters {
    journals: usize,
    user_info: usize,
    entry_fetches: usize,
    pushes: usize,
}

#[derive(Default)]
struct State {
    user_info: Option<UserInfo>,
    journals: Vec<Journal>,
    entries: BTreeMap<String, Vec<EncryptedEntry>>,
    /// Pushes to reject after another client appended
    conflicts: usize,
    calls: Counters,
}

#[derive(Default)]
struct FakeServer {
    state: Mutex<State>,
    /// Account key of the other client appending entries
    account_key: Mutex<Option<Vec<u8>>>,
}

impl FakeServer {
    fn with_journal(uid: &str, name: &str) -> Arc<Self> {
        let server = Arc::new(FakeServer::default());
        server.add_journal(uid, name);
        server
    }

    fn add_journal(&self, uid: &str, name: &str) {
        let journal = Journal::seal(uid, &derived(), &CollectionInfo::tasks(name)).unwrap();
        self.insert_journal(journal);
    }

    fn insert_journal(&self, journal: Journal) {
        let mut state = self.state.lock().unwrap();
        state.entries.entry(journal.uid.clone()).or_default();
        state.journals.push(journal);
    }

    fn crypto(&self, uid: &str) -> tasksync_provider_journal::CryptoManager {
        let state = self.state.lock().unwrap();
        let journal = state.journals.iter().find(|j| j.uid == uid).unwrap();
        let account_key = self.account_key.lock().unwrap().clone();
        journal.crypto(&derived(), account_key.as_deref()).unwrap()
    }

    fn tail(&self, uid: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.entries[uid].last().map(|e| e.uid.clone())
    }

    /// Append an entry the way another client would.
    fn append(&self, uid: &str, action: Action, content: String) -> String {
        let crypto = self.crypto(uid);
        let prev = self.tail(uid);
        let entry =
            EncryptedEntry::seal(&crypto, prev.as_deref(), &SyncEntry { action, content }).unwrap();
        let entry_uid = entry.uid.clone();
        let mut state = self.state.lock().unwrap();
        state.entries.get_mut(uid).unwrap().push(entry);
        set_last_uid(&mut state, uid);
        entry_uid
    }

    /// Decrypt the whole chain, checking every link.
    fn opened(&self, uid: &str) -> Vec<SyncEntry> {
        let crypto = self.crypto(uid);
        let entries = self.state.lock().unwrap().entries[uid].clone();
        let mut prev: Option<String> = None;
        entries
            .iter()
            .map(|e| {
                let opened = e.open(&crypto, prev.as_deref()).expect("chain should verify");
                prev = Some(e.uid.clone());
                opened
            })
            .collect()
    }

    fn reset_calls(&self) {
        self.state.lock().unwrap().calls = Counters::default();
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}

fn set_last_uid(state: &mut State, uid: &str) {
    let last = state.entries[uid].last().map(|e| e.uid.clone());
    if let Some(journal) = state.journals.iter_mut().find(|j| j.uid == uid) {
        journal.last_uid = last;
    }
}

#[async_trait]
impl JournalTransport for FakeServer {
    async fn user_info(&self, _username: &str) -> SyncResult<Option<UserInfo>> {
        let mut state = self.state.lock().unwrap();
        state.calls.user_info += 1;
        Ok(state.user_info.clone())
    }

    async fn journals(&self) -> SyncResult<Vec<Journal>> {
        let mut state = self.state.lock().unwrap();
        state.calls.journals += 1;
        Ok(state.journals.clone())
    }

    async fn journal(&self, uid: &str) -> SyncResult<Journal> {
        let state = self.state.lock().unwrap();
        state
            .journals
            .iter()
            .find(|j| j.uid == uid)
            .cloned()
            .ok_or_else(|| SyncError::Http {
                status: 404,
                message: "Not Found".into(),
            })
    }

    async fn entries(
        &self,
        journal: &str,
        last: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<EncryptedEntry>> {
        let mut state = self.state.lock().unwrap();
        state.calls.entry_fetches += 1;
        let entries = &state.entries[journal];
        let start = match last {
            None => 0,
            Some(last) => match entries.iter().position(|e| e.uid == last) {
                Some(i) => i + 1,
                None => {
                    return Err(SyncError::Http {
                        status: 400,
                        message: format!("Unknown entry {}", last),
                    });
                }
            },
        };
        Ok(entries.iter().skip(start).take(limit).cloned().collect())
    }

    async fn push_entries(
        &self,
        journal: &str,
        entries: &[EncryptedEntry],
        last: Option<&str>,
    ) -> SyncResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.pushes += 1;
            if state.conflicts == 0 {
                let tail = state.entries[journal].last().map(|e| e.uid.clone());
                if tail.as_deref() != last {
                    return Err(SyncError::Conflict(format!("{} moved on", journal)));
                }
                state
                    .entries
                    .get_mut(journal)
                    .unwrap()
                    .extend(entries.iter().cloned());
                set_last_uid(&mut state, journal);
                return Ok(());
            }
            state.conflicts -= 1;
        }
        self.append(journal, Action::Add, vtodo("racer", "Added elsewhere"));
        Err(SyncError::Conflict(format!("{} moved on", journal)))
    }
}

fn vtodo(uid: &str, summary: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\nBEGIN:VTODO\r\nUID:{}\r\nDTSTAMP:20250101T000000Z\r\nSUMMARY:{}\r\nEND:VTODO\r\nEND:VCALENDAR\r\n",
        uid, summary
    )
}

fn summary_of(entry: &SyncEntry) -> String {
    entry
        .content
        .lines()
        .find_map(|l| l.strip_prefix("SUMMARY:"))
        .unwrap_or_default()
        .to_string()
}

struct NoSync;

impl SyncRequester for NoSync {
    fn request_sync(&self, _account: &str) {}
}

struct Harness {
    store: Arc<LocalStore>,
    keys: Arc<JournalKeyCache>,
    sync: JournalSynchronizer,
}

impl Harness {
    fn new(server: Arc<FakeServer>) -> Self {
        let store = Arc::new(LocalStore::in_memory());
        store
            .upsert_account(&Account::new(
                "ete",
                "ete",
                Backend::Journal {
                    url: "https://journal.example.com/".into(),
                    username: "alice".into(),
                },
            ))
            .unwrap();
        let keys = Arc::new(JournalKeyCache::new());
        keys.init("ete", derived());
        let sync = JournalSynchronizer::new(store.clone(), server.clone(), keys.clone())
            .with_retry(RetryPolicy::no_retry(Duration::from_secs(5)));
        Harness {
            store,
            keys,
            sync,
        }
    }

    async fn run(&self) -> SyncResult<()> {
        let account = self.store.fetch_account("ete").unwrap().unwrap();
        self.sync.sync(&account, &Cancellation::new()).await
    }

    fn list(&self, journal: &str) -> TaskList {
        self.store
            .lists_for_account("ete")
            .unwrap()
            .into_iter()
            .find(|l| l.url == journal)
            .expect("list should exist")
    }

    fn task_by_title(&self, title: &str) -> Task {
        self.store
            .tasks()
            .unwrap()
            .into_iter()
            .find(|t| t.title == title)
            .unwrap_or_else(|| panic!("no task titled {}", title))
    }

    fn move_to(&self, task: TaskId, journal: &str) {
        let mover = TaskMover::new(self.store.clone(), Arc::new(NoSync));
        let report = mover.move_tasks(&[task], &self.list(journal).id).unwrap();
        assert_eq!(report.moved, vec![task]);
    }

    fn edit(&self, title: &str, new_title: &str) -> Task {
        let mut task = self.task_by_title(title);
        task.title = new_title.into();
        task.modified = task.modified + chrono::Duration::seconds(1);
        self.store.upsert_task(&task).unwrap();
        task
    }
}

#[tokio::test]
async fn first_sync_replays_journal_then_stays_quiet() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let tail = server.append(INBOX, Action::Add, vtodo("b", "Call mom"));
    let h = Harness::new(server.clone());

    h.run().await.unwrap();
    let list = h.list(INBOX);
    assert_eq!(list.name, "Inbox");
    assert_eq!(list.change_token.as_deref(), Some(tail.as_str()));
    assert_eq!(h.store.tasks().unwrap().len(), 2);
    assert!(h.store.list_dirty_links(&list.id).unwrap().is_empty());

    server.reset_calls();
    h.run().await.unwrap();
    server.with_state(|s| {
        assert_eq!(s.calls.entry_fetches, 0);
        assert_eq!(s.calls.pushes, 0);
    });
    assert_eq!(h.list(INBOX).change_token.as_deref(), Some(tail.as_str()));
}

#[tokio::test]
async fn remote_change_updates_task() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    let tail = server.append(INBOX, Action::Change, vtodo("a", "Buy oat milk"));
    h.run().await.unwrap();

    assert_eq!(h.store.tasks().unwrap().len(), 1);
    h.task_by_title("Buy oat milk");
    assert_eq!(h.list(INBOX).change_token.as_deref(), Some(tail.as_str()));
}

#[tokio::test]
async fn local_edit_is_appended_as_change() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    h.edit("Buy milk", "Buy oat milk");
    server.reset_calls();
    h.run().await.unwrap();

    server.with_state(|s| {
        assert_eq!(s.calls.entry_fetches, 0);
        assert_eq!(s.calls.pushes, 1);
    });
    let entries = server.opened(INBOX);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].action, Action::Change);
    assert_eq!(summary_of(&entries[1]), "Buy oat milk");

    let list = h.list(INBOX);
    assert_eq!(list.change_token, server.tail(INBOX));
    assert!(h.store.list_dirty_links(&list.id).unwrap().is_empty());
}

#[tokio::test]
async fn new_local_task_is_appended_as_add() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    let list = h.list(INBOX);
    assert_eq!(list.change_token, None);
    let task = h.store.insert_task(Task::new("Plan trip")).unwrap();
    let link = h
        .store
        .upsert_remote_link(RemoteLink::with_new_remote_id(task.id, list.id.clone()))
        .unwrap();

    h.run().await.unwrap();

    let entries = server.opened(INBOX);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, Action::Add);
    assert!(entries[0].content.contains(&format!("UID:{}", link.remote_id)));
    let link = h.store.get_remote_link(task.id, &list.id).unwrap().unwrap();
    assert_eq!(link.etag, server.tail(INBOX));
    assert!(link.payload.is_some());
}

#[tokio::test]
async fn remote_delete_soft_deletes_task() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();
    let task = h.task_by_title("Buy milk");

    server.append(INBOX, Action::Delete, vtodo("a", "Buy milk"));
    h.run().await.unwrap();

    let task = h.store.fetch_task(task.id).unwrap().unwrap();
    assert!(task.is_deleted());
    assert!(h.store.links_for_task(task.id).unwrap().is_empty());
    server.with_state(|s| assert_eq!(s.entries[INBOX].len(), 2));
}

#[tokio::test]
async fn tombstone_is_appended_as_delete() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    let task = h.task_by_title("Buy milk");
    let list = h.list(INBOX);
    let mut link = h.store.get_remote_link(task.id, &list.id).unwrap().unwrap();
    link.deleted_at = Some(chrono::Utc::now());
    h.store.upsert_remote_link(link).unwrap();

    h.run().await.unwrap();

    let entries = server.opened(INBOX);
    assert_eq!(entries.last().map(|e| e.action), Some(Action::Delete));
    assert!(h.store.links_for_list(&list.id).unwrap().is_empty());
    let task = h.store.fetch_task(task.id).unwrap().unwrap();
    assert!(!task.is_deleted(), "moving away keeps the task");
}

#[tokio::test]
async fn conflicting_push_pulls_and_retries() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    h.edit("Buy milk", "Buy oat milk");
    server.with_state(|s| s.conflicts = 1);
    server.reset_calls();
    h.run().await.unwrap();

    server.with_state(|s| assert_eq!(s.calls.pushes, 2));
    let entries = server.opened(INBOX);
    let summaries: Vec<String> = entries.iter().map(summary_of).collect();
    assert_eq!(summaries, vec!["Buy milk", "Added elsewhere", "Buy oat milk"]);
    h.task_by_title("Added elsewhere");
    h.task_by_title("Buy oat milk");
    assert_eq!(h.list(INBOX).change_token, server.tail(INBOX));
}

#[tokio::test]
async fn persistent_conflicts_give_up_and_keep_edit() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    let edited = h.edit("Buy milk", "Buy oat milk");
    server.with_state(|s| s.conflicts = 10);
    server.reset_calls();

    let err = h.run().await.unwrap_err();
    assert!(err.is_conflict());
    server.with_state(|s| assert_eq!(s.calls.pushes, 3));

    let list = h.list(INBOX);
    let dirty = h.store.list_dirty_links(&list.id).unwrap();
    assert!(dirty.iter().any(|l| l.task_id == edited.id));
    assert_eq!(
        h.store.fetch_task(edited.id).unwrap().unwrap().title,
        "Buy oat milk"
    );
}

#[tokio::test]
async fn tampered_entry_fails_only_its_journal() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.add_journal(WORK, "Work");
    let good = server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    server.append(INBOX, Action::Add, vtodo("b", "Call mom"));
    server.append(WORK, Action::Add, vtodo("w", "Write report"));
    server.with_state(|s| {
        let entries = s.entries.get_mut(INBOX).unwrap();
        entries[1].content = entries[0].content.clone();
    });
    let h = Harness::new(server.clone());

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Integrity(_)));

    h.task_by_title("Buy milk");
    h.task_by_title("Write report");
    assert_eq!(h.store.tasks().unwrap().len(), 2);
    assert_eq!(h.list(INBOX).change_token.as_deref(), Some(good.as_str()));
    assert_eq!(h.list(WORK).change_token, server.tail(WORK));
}

#[tokio::test]
async fn unreadable_journals_fail_the_pass_but_not_the_others() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let foreign = DerivedKey::from_bytes([7u8; 32]);
    server.insert_journal(
        Journal::seal("foreign", &foreign, &CollectionInfo::tasks("Foreign")).unwrap(),
    );
    let mut future = Journal::seal("future", &derived(), &CollectionInfo::tasks("Future")).unwrap();
    future.version = 3;
    server.insert_journal(future);
    let mut calendar = CollectionInfo::tasks("Calendar");
    calendar.kind = "CALENDAR".into();
    server.insert_journal(Journal::seal("calendar", &derived(), &calendar).unwrap());
    let h = Harness::new(server);

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Integrity(_)));

    h.task_by_title("Buy milk");
    let lists = h.store.lists_for_account("ete").unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].url, INBOX);
}

#[tokio::test]
async fn journal_past_supported_version_keeps_its_list() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.add_journal(WORK, "Work");
    server.append(WORK, Action::Add, vtodo("w", "Write report"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    server.with_state(|s| {
        let work = s.journals.iter_mut().find(|j| j.uid == WORK).unwrap();
        work.version = 3;
    });
    let err = h.run().await.unwrap_err();

    assert!(matches!(err, SyncError::VersionTooNew { .. }));
    h.list(WORK);
    h.task_by_title("Write report");
}

#[tokio::test]
async fn vanished_journal_removes_list() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.add_journal(WORK, "Work");
    server.append(WORK, Action::Add, vtodo("w", "Write report"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();
    assert_eq!(h.store.tasks().unwrap().len(), 1);

    server.with_state(|s| s.journals.retain(|j| j.uid != WORK));
    h.run().await.unwrap();

    let lists = h.store.lists_for_account("ete").unwrap();
    assert_eq!(lists.len(), 1);
    assert!(h.store.tasks().unwrap().is_empty());
}

#[tokio::test]
async fn journal_keys_come_from_cached_user_info() {
    let server = Arc::new(FakeServer::default());
    let account_key = [11u8; 32];
    *server.account_key.lock().unwrap() = Some(account_key.to_vec());
    server.with_state(|s| {
        s.user_info = Some(UserInfo::seal("alice", &derived(), &account_key).unwrap())
    });
    server.insert_journal(
        Journal::seal_with_key(INBOX, &account_key, &[12u8; 32], &CollectionInfo::tasks("Shared"))
            .unwrap(),
    );
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());

    h.run().await.unwrap();
    h.run().await.unwrap();

    h.task_by_title("Buy milk");
    server.with_state(|s| assert_eq!(s.calls.user_info, 1));
    assert_eq!(h.keys.account_key("ete"), Some(account_key.to_vec()));
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    let h = Harness::new(server.clone());
    h.keys.clear("ete");

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));
    server.with_state(|s| assert_eq!(s.calls.journals, 0));
}

#[tokio::test]
async fn read_only_journal_is_not_pushed() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.with_state(|s| s.journals[0].read_only = true);
    server.append(INBOX, Action::Add, vtodo("a", "Buy milk"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();

    h.edit("Buy milk", "Buy oat milk");
    server.reset_calls();
    h.run().await.unwrap();

    server.with_state(|s| assert_eq!(s.calls.pushes, 0));
    assert_eq!(server.opened(INBOX).len(), 1);
}

#[tokio::test]
async fn long_journals_are_fetched_in_batches() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    for i in 0..120 {
        server.append(INBOX, Action::Add, vtodo(&format!("t{}", i), &format!("Task {}", i)));
    }
    let h = Harness::new(server.clone());

    h.run().await.unwrap();

    server.with_state(|s| assert_eq!(s.calls.entry_fetches, 3));
    assert_eq!(h.store.tasks().unwrap().len(), 120);
    assert_eq!(h.list(INBOX).change_token, server.tail(INBOX));
}

#[tokio::test]
async fn cancelled_pass_does_not_touch_server() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    let h = Harness::new(server.clone());
    let cancel = Cancellation::new();
    cancel.cancel();

    let account = h.store.fetch_account("ete").unwrap().unwrap();
    let err = h.sync.sync(&account, &cancel).await.unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    server.with_state(|s| assert_eq!(s.calls.journals, 0));
}

#[tokio::test]
async fn moved_task_is_deleted_from_source_and_added_to_target() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.add_journal(WORK, "Work");
    server.append(WORK, Action::Add, vtodo("w", "Write report"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();
    let task = h.task_by_title("Write report");

    h.move_to(task.id, INBOX);
    h.run().await.unwrap();

    let work = server.opened(WORK);
    assert_eq!(work.last().map(|e| e.action), Some(Action::Delete));
    let inbox = server.opened(INBOX);
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].action, Action::Add);
    assert!(inbox[0].content.contains("UID:w"));

    assert!(h.store.links_for_list(&h.list(WORK).id).unwrap().is_empty());
    let links = h.store.links_for_task(task.id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].list_id, h.list(INBOX).id);
    assert!(links[0].payload.is_some());
}

#[tokio::test]
async fn task_deleted_after_move_is_still_deleted_from_source() {
    let server = FakeServer::with_journal(INBOX, "Inbox");
    server.add_journal(WORK, "Work");
    server.append(WORK, Action::Add, vtodo("w", "Write report"));
    let h = Harness::new(server.clone());
    h.run().await.unwrap();
    let task = h.task_by_title("Write report");

    h.move_to(task.id, INBOX);
    h.store.mark_deleted(task.id, chrono::Utc::now()).unwrap();
    h.run().await.unwrap();

    // The target never saw the task; the source hears about the delete
    assert!(server.opened(INBOX).is_empty());
    let work = server.opened(WORK);
    assert_eq!(work.len(), 2);
    assert_eq!(work[1].action, Action::Delete);

    assert!(h.store.links_for_task(task.id).unwrap().is_empty());
    assert!(h.store.fetch_task(task.id).unwrap().is_none());
}
