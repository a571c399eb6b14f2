//! Property-based tests for document convergence
//!
//! Uses proptest to check that replicas converge no matter in which order,
//! or how many times, deltas are delivered, including when edits land on
//! replicas that have only merged part of each other's history.

use proptest::prelude::*;
use tablesync_core::{ChatMessage, DocOp, DocState, Note, PeerId, SessionDoc, TokenRecord};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Operations a replica can perform without depending on existing items
#[derive(Debug, Clone)]
enum Edit {
    MoveToken { id: &'static str, x: i32, y: i32 },
    AddNote(String),
    Say(String),
}

fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 ]{1,40}").expect("valid regex")
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (prop::sample::select(vec!["orc", "elf", "dragon"]), -50..50i32, -50..50i32)
            .prop_map(|(id, x, y)| Edit::MoveToken { id, x, y }),
        1 => text_strategy().prop_map(Edit::AddNote),
        2 => text_strategy().prop_map(Edit::Say),
    ]
}

/// Edits tagged with the replica (0..3) that performs them
fn workload_strategy(max_edits: usize) -> impl Strategy<Value = Vec<(usize, Edit)>> {
    prop::collection::vec((0..3usize, edit_strategy()), 1..max_edits)
}

/// One step of an interleaved run across three replicas
#[derive(Debug, Clone)]
enum Step {
    Edit { replica: usize, edit: Edit },
    /// Retitle the `pick`-th note the replica currently holds
    ReviseNote { replica: usize, pick: usize, title: String },
    /// Remove the `pick`-th note the replica currently holds
    DropNote { replica: usize, pick: usize },
    /// Deliver the `pick`-th delta produced so far to `to`
    Merge { to: usize, pick: usize },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..3usize, edit_strategy()).prop_map(|(replica, edit)| Step::Edit { replica, edit }),
        2 => (0..3usize, 0..8usize, text_strategy())
            .prop_map(|(replica, pick, title)| Step::ReviseNote { replica, pick, title }),
        1 => (0..3usize, 0..8usize).prop_map(|(replica, pick)| Step::DropNote { replica, pick }),
        5 => (0..3usize, 0..64usize).prop_map(|(to, pick)| Step::Merge { to, pick }),
    ]
}

fn to_op(replica: usize, edit: &Edit) -> DocOp {
    match edit {
        Edit::MoveToken { id, x, y } => DocOp::UpsertToken(TokenRecord::new(*id, *id, *x, *y)),
        Edit::AddNote(title) => DocOp::AppendNote(Note::new(title.clone(), "")),
        Edit::Say(text) => DocOp::AppendMessage(ChatMessage::new(
            PeerId::new(format!("player-{}", replica)),
            format!("Player {}", replica),
            text.clone(),
        )),
    }
}

/// Run the workload on independent replicas, returning them and every delta
fn run_workload(workload: &[(usize, Edit)]) -> (Vec<SessionDoc>, Vec<Vec<u8>>) {
    let mut replicas: Vec<SessionDoc> = (0..3).map(|_| SessionDoc::new().unwrap()).collect();
    let mut deltas = Vec::new();
    for (replica, edit) in workload {
        let delta = replicas[*replica].apply(&to_op(*replica, edit)).unwrap();
        deltas.push(delta);
    }
    (replicas, deltas)
}

/// Run steps in order; edits see whatever the replica has merged so far
fn run_interleaved(steps: &[Step]) -> (Vec<SessionDoc>, Vec<Vec<u8>>) {
    let mut replicas: Vec<SessionDoc> = (0..3).map(|_| SessionDoc::new().unwrap()).collect();
    let mut deltas: Vec<Vec<u8>> = Vec::new();
    for step in steps {
        match step {
            Step::Edit { replica, edit } => {
                deltas.push(replicas[*replica].apply(&to_op(*replica, edit)).unwrap());
            }
            Step::ReviseNote { replica, pick, title } => {
                let notes = replicas[*replica].notes().unwrap();
                if let Some(note) = notes.get(pick % notes.len().max(1)) {
                    let mut revised = note.clone();
                    revised.title = title.clone();
                    deltas.push(replicas[*replica].apply(&DocOp::ReplaceNote(revised)).unwrap());
                }
            }
            Step::DropNote { replica, pick } => {
                let notes = replicas[*replica].notes().unwrap();
                if let Some(note) = notes.get(pick % notes.len().max(1)) {
                    deltas.push(replicas[*replica].apply(&DocOp::RemoveNote(note.id)).unwrap());
                }
            }
            Step::Merge { to, pick } => {
                if !deltas.is_empty() {
                    let delta = &deltas[pick % deltas.len()];
                    replicas[*to].merge_delta(delta).unwrap();
                }
            }
        }
    }
    (replicas, deltas)
}

fn receive_all(deltas: &[Vec<u8>]) -> DocState {
    let mut doc = SessionDoc::new().unwrap();
    for delta in deltas {
        doc.merge_delta(delta).unwrap();
    }
    doc.state().unwrap()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Delivery order never changes the converged state
    #[test]
    fn converges_under_any_order(
        (workload, order) in workload_strategy(24).prop_flat_map(|workload| {
            let indices: Vec<usize> = (0..workload.len()).collect();
            (Just(workload), Just(indices).prop_shuffle())
        })
    ) {
        let (_, deltas) = run_workload(&workload);
        let in_order = receive_all(&deltas);

        let shuffled: Vec<Vec<u8>> = order.iter().map(|&i| deltas[i].clone()).collect();
        prop_assert_eq!(receive_all(&shuffled), in_order);
    }

    /// Delivering deltas more than once changes nothing
    #[test]
    fn duplicates_are_harmless(
        workload in workload_strategy(16),
        repeats in prop::collection::vec(0..16usize, 0..16),
    ) {
        let (_, deltas) = run_workload(&workload);
        let once = receive_all(&deltas);

        let mut noisy = deltas.clone();
        for i in repeats {
            noisy.push(deltas[i % deltas.len()].clone());
        }
        noisy.extend(deltas.iter().rev().cloned());
        prop_assert_eq!(receive_all(&noisy), once);
    }

    /// Every producing replica reaches the same state as a pure receiver
    #[test]
    fn producers_and_receivers_agree(workload in workload_strategy(16)) {
        let (mut replicas, deltas) = run_workload(&workload);
        let expected = receive_all(&deltas);

        for replica in replicas.iter_mut() {
            for delta in &deltas {
                replica.merge_delta(delta).unwrap();
            }
            prop_assert_eq!(&replica.state().unwrap(), &expected);
        }
    }

    /// Edits made after partial merges still converge once everything is delivered
    #[test]
    fn interleaved_edits_and_merges_converge(
        steps in prop::collection::vec(step_strategy(), 1..40)
    ) {
        let (mut replicas, deltas) = run_interleaved(&steps);
        let expected = receive_all(&deltas);

        for replica in replicas.iter_mut() {
            for delta in deltas.iter().rev() {
                replica.merge_delta(delta).unwrap();
            }
            prop_assert_eq!(&replica.state().unwrap(), &expected);
        }
    }

    /// Exchanging only what each side's heads say is missing also converges
    #[test]
    fn heads_exchange_converges(
        steps in prop::collection::vec(step_strategy(), 1..40)
    ) {
        let (mut replicas, _) = run_interleaved(&steps);

        for _ in 0..2 {
            for from in 0..3 {
                for to in 0..3 {
                    if from == to {
                        continue;
                    }
                    let heads = replicas[to].heads();
                    if let Some(missing) = replicas[from].changes_since(&heads) {
                        replicas[to].merge_delta(&missing).unwrap();
                    }
                }
            }
        }

        let expected = replicas[0].state().unwrap();
        let mut expected_heads = replicas[0].heads();
        expected_heads.sort();
        for replica in replicas.iter_mut() {
            prop_assert_eq!(&replica.state().unwrap(), &expected);
            let mut heads = replica.heads();
            heads.sort();
            prop_assert_eq!(&heads, &expected_heads);
            prop_assert!(replica.changes_since(&expected_heads).is_none());
        }
    }

    /// Concurrent moves of one token leave exactly one position everywhere
    #[test]
    fn concurrent_token_moves_pick_one_winner(
        moves in prop::collection::vec((0..3usize, -20..20i32, -20..20i32), 2..6)
    ) {
        let workload: Vec<(usize, Edit)> = moves
            .into_iter()
            .map(|(replica, x, y)| (replica, Edit::MoveToken { id: "orc", x, y }))
            .collect();
        let (mut replicas, deltas) = run_workload(&workload);

        let mut positions = Vec::new();
        for replica in replicas.iter_mut() {
            for delta in deltas.iter().rev() {
                replica.merge_delta(delta).unwrap();
            }
            let tokens = replica.tokens().unwrap();
            prop_assert_eq!(tokens.len(), 1);
            let orc = tokens.values().next().unwrap();
            positions.push((orc.x, orc.y));
        }
        positions.dedup();
        prop_assert_eq!(positions.len(), 1);
    }
}

#[test]
fn chat_cap_holds_after_merges() {
    let mut a = SessionDoc::new().unwrap().with_max_messages(5);
    let mut b = SessionDoc::new().unwrap().with_max_messages(5);

    let mut deltas = Vec::new();
    for i in 0..8 {
        let sender = PeerId::new("aria");
        deltas.push(
            a.apply(&DocOp::AppendMessage(ChatMessage::new(sender, "Aria", format!("line {}", i))))
                .unwrap(),
        );
    }
    for delta in &deltas {
        b.merge_delta(delta).unwrap();
    }

    let messages = b.messages().unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages.last().unwrap().text, "line 7");
    assert_eq!(b.state().unwrap(), a.state().unwrap());
}
