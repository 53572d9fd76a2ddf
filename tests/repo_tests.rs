#![cfg(feature = "inmem-store")]

use pastpapers::{
    auth::Role,
    models::{AnswerEdit, CommentEdit, Id, NewAnswer, NewComment, NewPaper, NewQuestion, NewUserRecord},
    papers::PaperError,
    repo::{inmem::InMemRepo, RepoError},
    votes::{VoteDirection, VoteError},
};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use pastpapers::repo::{AnswerRepo, CommentRepo, PaperRepo, QuestionRepo, UserRepo};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    InMemRepo::ephemeral()
}

fn paper(course: &str, year: i32, title: &str) -> NewPaper {
    NewPaper { course: course.into(), year, title: title.into(), pdf: "JVBERi0xLjQK".into() }
}

async fn user(r: &InMemRepo, name: &str) -> Id {
    r.create_user(NewUserRecord { username: name.into(), password_hash: "x".into(), role: Role::Student })
        .await
        .unwrap()
        .id
}

/// Paper with one question; returns the question id.
async fn question(r: &InMemRepo) -> Id {
    let p = r.create_paper(paper("C212", 2016, "Java")).await.unwrap();
    r.create_questions(p.id, vec![NewQuestion { number: "1".into() }]).await.unwrap()[0].id
}

async fn answer(r: &InMemRepo, author: Id, question: Id) -> Id {
    r.create_answer(author, NewAnswer { question, user: None, html: "<p>a</p>".into() }).await.unwrap().id
}

fn comment(answer: Id, parent: Option<Id>, html: &str) -> NewComment {
    NewComment { answer, parent, user: None, html: html.into() }
}

#[tokio::test]
async fn usernames_are_unique() {
    let r = repo();
    user(&r, "alice").await;
    let err = r
        .create_user(NewUserRecord { username: "alice".into(), password_hash: "y".into(), role: Role::Staff })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Conflict(_)));
    assert_eq!(r.count_users_with_role(Role::Staff).await.unwrap(), 0);
    assert_eq!(r.find_user_by_username("alice").await.unwrap().role, Role::Student);
}

#[tokio::test]
async fn papers_share_course_title() {
    let r = repo();
    let a = r.create_paper(paper("C212", 2015, "Java")).await.unwrap();
    let b = r.create_paper(paper("C212", 2016, "Java")).await.unwrap();
    assert_eq!(a.title_id, b.title_id);

    let err = r.create_paper(paper("C212", 2016, "Java")).await.unwrap_err();
    assert!(matches!(err, RepoError::Paper(PaperError::DuplicateExists { year: 2016, .. })));
    let err = r.create_paper(paper("C212", 2017, "Haskell")).await.unwrap_err();
    assert!(matches!(err, RepoError::Paper(PaperError::TitleMismatch { .. })));

    let other = r.create_paper(paper("C141", 2016, "Logic")).await.unwrap();
    assert_ne!(other.title_id, a.title_id);

    let listing = r.list_papers().await.unwrap();
    assert_eq!(listing.len(), 3);
    assert_eq!(r.find_paper("C212", 2016).await.unwrap().id, b.id);
    assert!(matches!(r.find_paper("C212", 2020).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn question_batches_are_all_or_nothing() {
    let r = repo();
    let p = r.create_paper(paper("C212", 2016, "Java")).await.unwrap();
    r.create_questions(p.id, vec![NewQuestion { number: "1".into() }]).await.unwrap();

    let err = r
        .create_questions(p.id, vec![NewQuestion { number: "2".into() }, NewQuestion { number: "1".into() }])
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));
    let err = r
        .create_questions(p.id, vec![NewQuestion { number: "3".into() }, NewQuestion { number: "3".into() }])
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));
    assert_eq!(r.list_questions(p.id).await.unwrap().len(), 1);

    assert!(matches!(
        r.create_questions(999, vec![NewQuestion { number: "1".into() }]).await,
        Err(RepoError::NotFound)
    ));
}

#[tokio::test]
async fn vote_ledger_transitions() {
    let r = repo();
    let author = user(&r, "author").await;
    let voter = user(&r, "voter").await;
    let q = question(&r).await;
    let a = answer(&r, author, q).await;

    assert_eq!(r.apply_vote(a, voter, VoteDirection::Up).await.unwrap(), 1);
    assert!(matches!(r.apply_vote(a, voter, VoteDirection::Up).await, Err(RepoError::Vote(VoteError::AlreadyVoted))));
    assert!(matches!(r.apply_vote(a, author, VoteDirection::Up).await, Err(RepoError::Vote(VoteError::SelfVote))));
    assert_eq!(r.apply_vote(a, voter, VoteDirection::Down).await.unwrap(), 0);
    assert!(matches!(r.apply_vote(a, voter, VoteDirection::Down).await, Err(RepoError::Vote(VoteError::NotVoted))));
    assert!(matches!(r.apply_vote(12345, voter, VoteDirection::Up).await, Err(RepoError::NotFound)));

    let stored = r.get_answer(a).await.unwrap();
    assert_eq!(stored.votes, 0);
    assert!(stored.voters.is_empty());
}

#[test]
fn concurrent_upvotes_are_not_lost() {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let r = repo();
    let (a, voters) = rt.block_on(async {
        let author = user(&r, "author").await;
        let q = question(&r).await;
        let a = answer(&r, author, q).await;
        let mut voters = Vec::new();
        for i in 0..16 {
            voters.push(user(&r, &format!("v{i}")).await);
        }
        (a, voters)
    });

    let handles: Vec<_> = voters
        .into_iter()
        .map(|v| {
            let r = r.clone();
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(r.apply_vote(a, v, VoteDirection::Up)).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stored = rt.block_on(r.get_answer(a)).unwrap();
    assert_eq!(stored.votes, 16);
    assert_eq!(stored.voters.len(), 16);
}

#[tokio::test]
async fn answer_edits_follow_protocol() {
    let r = repo();
    let owner = user(&r, "owner").await;
    let other = user(&r, "other").await;
    let q = question(&r).await;
    let a = answer(&r, owner, q).await;
    let before = r.get_answer(a).await.unwrap();

    let edit = |id, html: &str| AnswerEdit { id, html: Some(html.into()), ..Default::default() };
    assert!(matches!(r.update_answer(owner, edit(999, "x")).await, Err(RepoError::NotFound)));
    assert!(matches!(r.update_answer(other, edit(a, "x")).await, Err(RepoError::Forbidden)));
    let locked = AnswerEdit { id: a, votes: Some(serde_json::json!(10)), ..Default::default() };
    assert!(matches!(r.update_answer(owner, locked).await, Err(RepoError::Validation(_))));

    let after = r.update_answer(owner, edit(a, "<p>b</p>")).await.unwrap();
    assert_eq!(after.html, "<p>b</p>");
    assert_eq!(after.author_id, before.author_id);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.votes, before.votes);
}

#[tokio::test]
async fn comment_edits_and_subtree_delete() {
    let r = repo();
    let owner = user(&r, "owner").await;
    let other = user(&r, "other").await;
    let q = question(&r).await;
    let a = answer(&r, owner, q).await;

    let root = r.create_comment(other, comment(a, None, "root")).await.unwrap();
    let child = r.create_comment(owner, comment(a, Some(root.id), "child")).await.unwrap();
    let grandchild = r.create_comment(other, comment(a, Some(child.id), "grandchild")).await.unwrap();
    let sibling = r.create_comment(owner, comment(a, None, "sibling")).await.unwrap();

    // a parent from another answer is refused
    let a2 = answer(&r, owner, q).await;
    let err = r.create_comment(owner, comment(a2, Some(root.id), "cross")).await.unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));
    assert!(matches!(r.create_comment(owner, comment(a, Some(424242), "x")).await, Err(RepoError::NotFound)));

    let locked = CommentEdit { id: child.id, parent: Some(serde_json::json!(sibling.id)), ..Default::default() };
    assert!(matches!(r.update_comment(owner, locked).await, Err(RepoError::Validation(_))));
    let ok = CommentEdit { id: child.id, html: Some("edited".into()), ..Default::default() };
    let edited = r.update_comment(owner, ok).await.unwrap();
    assert_eq!(edited.parent_id, Some(root.id));
    assert_eq!(edited.html, "edited");

    assert!(matches!(r.delete_comment(owner, root.id).await, Err(RepoError::Forbidden)));
    r.delete_comment(other, root.id).await.unwrap();
    let left: Vec<Id> = r.list_comments(a).await.unwrap().iter().map(|c| c.id).collect();
    assert_eq!(left, vec![sibling.id]);
    assert!(matches!(r.get_comment(grandchild.id).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn deleting_a_paper_cascades() {
    let r = repo();
    let owner = user(&r, "owner").await;
    let q = question(&r).await;
    let a = answer(&r, owner, q).await;
    let c = r.create_comment(owner, comment(a, None, "c")).await.unwrap();
    let p = r.get_question(q).await.unwrap().paper_id;

    r.delete_paper(p).await.unwrap();
    assert!(matches!(r.get_question(q).await, Err(RepoError::NotFound)));
    assert!(matches!(r.get_answer(a).await, Err(RepoError::NotFound)));
    assert!(matches!(r.get_comment(c.id).await, Err(RepoError::NotFound)));
    assert!(matches!(r.delete_paper(p).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let (a, voter) = {
        let r = InMemRepo::at(&path).unwrap();
        let author = user(&r, "author").await;
        let voter = user(&r, "voter").await;
        let q = question(&r).await;
        let a = answer(&r, author, q).await;
        r.apply_vote(a, voter, VoteDirection::Up).await.unwrap();
        (a, voter)
    };
    let reloaded = InMemRepo::at(&path).unwrap();
    let stored = reloaded.get_answer(a).await.unwrap();
    assert_eq!(stored.votes, 1);
    assert!(stored.voters.contains(voter));
    // ids keep counting after a reload
    let next = user(&reloaded, "late").await;
    assert!(next > a);
}

#[test]
fn concurrent_writers_leave_a_complete_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let r = InMemRepo::at(&path).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|t| {
            let r = r.clone();
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                for i in 0..10 {
                    rt.block_on(r.create_user(NewUserRecord {
                        username: format!("u{t}-{i}"),
                        password_hash: "x".into(),
                        role: Role::Student,
                    }))
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    serde_json::from_slice::<serde_json::Value>(&bytes).expect("snapshot is valid JSON");
    assert!(!dir.path().join("state.json.tmp").exists());

    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let reloaded = InMemRepo::at(&path).unwrap();
    for t in 0..16 {
        for i in 0..10 {
            rt.block_on(reloaded.find_user_by_username(&format!("u{t}-{i}"))).unwrap();
        }
    }
}

#[test]
fn unreadable_snapshot_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"{\"users\": {}, \"titl").unwrap();
    assert!(matches!(InMemRepo::at(&path), Err(RepoError::Internal(_))));
    // the broken file is left for an operator to inspect
    assert_eq!(std::fs::read(&path).unwrap(), b"{\"users\": {}, \"titl");
}

#[test]
fn missing_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let r = InMemRepo::at(dir.path().join("nested/state.json")).unwrap();
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert!(rt.block_on(r.list_papers()).unwrap().is_empty());
}
