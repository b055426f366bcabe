use serde_json::{json, Map, Value};
use speculate2::speculate;
use taskstore_core::db::schema::{MODEL_INDEXES, MODEL_TABLES, MODEL_TRIGGERS};
use taskstore_core::db::{self, Database};
use taskstore_core::migrate::{catalog, Migrator, Target};
use taskstore_core::models::*;
use uuid::Uuid;

fn migrated_db() -> Database {
    let chain = catalog::embedded_chain().unwrap();
    let mut db = Database::open_memory().unwrap();
    Migrator::new(&mut db, &chain).upgrade(&Target::Head).unwrap();
    db
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

fn task_in_new_context(db: &Database) -> Task {
    let context = db.create_context(CreateContextInput::default()).unwrap();
    db.create_task(CreateTaskInput {
        context_id: context.id,
        kind: TaskKind::Task,
        history: vec![json!({"role": "user", "text": "hello"})],
        metadata: object(json!({"skill_id": "summarize"})),
    })
    .unwrap()
}

fn count(db: &Database, sql: &str) -> i64 {
    db.connection().query_row(sql, [], |row| row.get(0)).unwrap()
}

speculate! {
    describe "head schema" {
        it "contains every model table, index and trigger" {
            let db = migrated_db();
            let snap = db::snapshot(db.connection()).unwrap();

            for table in MODEL_TABLES {
                assert!(snap.has_table(table), "missing {table}");
            }
            for index in MODEL_INDEXES {
                assert!(snap.has_index(index), "missing {index}");
            }
            for trigger in MODEL_TRIGGERS {
                assert!(snap.has_trigger(trigger), "missing {trigger}");
            }
            assert!(db::check_head_model(db.connection()).unwrap().is_empty());
        }

        it "reports what is missing below head" {
            let chain = catalog::embedded_chain().unwrap();
            let mut db = Database::open_memory().unwrap();
            Migrator::new(&mut db, &chain).upgrade(&Target::Relative(1)).unwrap();

            let problems = db::check_head_model(db.connection()).unwrap();

            assert!(problems.contains(&"missing table contexts".to_string()));
            assert!(problems.contains(&"missing foreign key tasks.context_id -> contexts".to_string()));
            assert!(problems.contains(&"missing trigger trg_tasks_touch".to_string()));
        }
    }

    describe "tasks" {
        it "creates a task with database defaults" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            assert_eq!(task.state, TaskState::Submitted);
            assert_eq!(task.kind, TaskKind::Task);
            assert!(task.artifacts.is_empty());
            assert_eq!(task.history.len(), 1);
            assert_eq!(task.metadata.get("skill_id"), Some(&json!("summarize")));
            assert_eq!(task.created_at, task.updated_at);
        }

        it "rejects a task whose context does not exist" {
            let db = migrated_db();

            let result = db.create_task(CreateTaskInput {
                context_id: Uuid::new_v4(),
                kind: TaskKind::Task,
                history: Vec::new(),
                metadata: Map::new(),
            });

            assert!(result.is_err());
            assert_eq!(count(&db, "SELECT COUNT(*) FROM tasks"), 0);
        }

        it "moves updated_at and state_timestamp forward on a state change" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            assert!(db.update_task_state(task.id, TaskState::Working).unwrap());
            let updated = db.get_task(task.id).unwrap().unwrap();

            assert_eq!(updated.state, TaskState::Working);
            assert!(updated.updated_at > task.updated_at);
            assert!(updated.state_timestamp >= task.state_timestamp);
            assert_eq!(updated.created_at, task.created_at);
        }

        it "keeps state_timestamp when only the history changes" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            assert!(db.append_task_message(task.id, &json!({"role": "agent", "text": "hi"})).unwrap());
            let updated = db.get_task(task.id).unwrap().unwrap();

            assert_eq!(updated.history.len(), 2);
            assert_eq!(updated.history[1]["role"], json!("agent"));
            assert_eq!(updated.state_timestamp, task.state_timestamp);
            assert!(updated.updated_at > task.updated_at);
        }

        it "overrides a caller-supplied updated_at" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            db.connection()
                .execute(
                    "UPDATE tasks SET updated_at = '2999-01-01T00:00:00.000Z' WHERE id = ?1",
                    [task.id.to_string()],
                )
                .unwrap();

            let stored: String = db
                .connection()
                .query_row("SELECT updated_at FROM tasks WHERE id = ?1", [task.id.to_string()], |row| row.get(0))
                .unwrap();
            assert!(stored.as_str() < "2999");
        }

        it "refuses to change created_at" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            let result = db.connection().execute(
                "UPDATE tasks SET created_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                [task.id.to_string()],
            );

            assert!(result.unwrap_err().to_string().contains("immutable"));
        }

        it "rejects malformed JSON columns and unknown states" {
            let db = migrated_db();
            let task = task_in_new_context(&db);
            let id = task.id.to_string();

            assert!(db.connection().execute("UPDATE tasks SET history = '{}' WHERE id = ?1", [&id]).is_err());
            assert!(db.connection().execute("UPDATE tasks SET metadata = 'nope' WHERE id = ?1", [&id]).is_err());
            assert!(db.connection().execute("UPDATE tasks SET state = 'paused' WHERE id = ?1", [&id]).is_err());
        }

        it "lists the tasks of one context" {
            let db = migrated_db();
            let first = task_in_new_context(&db);
            let sibling = db
                .create_task(CreateTaskInput {
                    context_id: first.context_id,
                    kind: TaskKind::Task,
                    history: Vec::new(),
                    metadata: Map::new(),
                })
                .unwrap();
            task_in_new_context(&db);

            let tasks = db.list_tasks_by_context(first.context_id).unwrap();

            let ids: Vec<Uuid> = tasks.iter().map(|task| task.id).collect();
            assert_eq!(ids.len(), 2);
            assert!(ids.contains(&first.id));
            assert!(ids.contains(&sibling.id));
        }

        it "reports a missing task on update" {
            let db = migrated_db();
            assert!(!db.update_task_state(Uuid::new_v4(), TaskState::Failed).unwrap());
        }
    }

    describe "contexts" {
        it "bumps updated_at on every write" {
            let db = migrated_db();
            let context = db
                .create_context(CreateContextInput { context_data: object(json!({"topic": "a"})) })
                .unwrap();

            for _ in 0..3 {
                db.connection()
                    .execute(
                        "UPDATE contexts SET context_data = json_set(context_data, '$.topic', 'b') WHERE id = ?1",
                        [context.id.to_string()],
                    )
                    .unwrap();
            }

            let updated = db.get_context(context.id).unwrap().unwrap();
            assert!(updated.updated_at > context.updated_at);
            assert_eq!(updated.context_data.get("topic"), Some(&json!("b")));
            assert!(updated.message_history.is_empty());
        }

        it "cascades a delete to tasks, feedback and webhook settings" {
            let db = migrated_db();
            let task = task_in_new_context(&db);
            db.add_feedback(CreateFeedbackInput {
                task_id: task.id,
                feedback_data: object(json!({"rating": 5})),
            })
            .unwrap();
            db.save_webhook_config(task.id, &object(json!({"url": "https://hooks.test/t"})))
                .unwrap();

            db.connection()
                .execute("DELETE FROM contexts WHERE id = ?1", [task.context_id.to_string()])
                .unwrap();

            assert!(db.get_task(task.id).unwrap().is_none());
            assert_eq!(count(&db, "SELECT COUNT(*) FROM task_feedback"), 0);
            assert_eq!(count(&db, "SELECT COUNT(*) FROM webhook_configs"), 0);
        }
    }

    describe "feedback" {
        it "keeps feedback in insertion order" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            let first = db
                .add_feedback(CreateFeedbackInput { task_id: task.id, feedback_data: object(json!({"rating": 4})) })
                .unwrap();
            let second = db
                .add_feedback(CreateFeedbackInput { task_id: task.id, feedback_data: object(json!({"rating": 2})) })
                .unwrap();

            let listed = db.list_feedback(task.id).unwrap();
            assert_eq!(listed.iter().map(|f| f.id).collect::<Vec<_>>(), vec![first.id, second.id]);
            assert_eq!(listed[1].feedback_data.get("rating"), Some(&json!(2)));
        }

        it "rejects feedback for an unknown task" {
            let db = migrated_db();

            let result = db.add_feedback(CreateFeedbackInput {
                task_id: Uuid::new_v4(),
                feedback_data: Map::new(),
            });

            assert!(result.is_err());
        }
    }

    describe "webhook settings" {
        it "replaces the stored config on save" {
            let db = migrated_db();
            let task = task_in_new_context(&db);

            db.save_webhook_config(task.id, &object(json!({"url": "https://a.test"}))).unwrap();
            let first = db.load_webhook_config(task.id).unwrap().unwrap();
            db.save_webhook_config(task.id, &object(json!({"url": "https://b.test"}))).unwrap();
            let second = db.load_webhook_config(task.id).unwrap().unwrap();

            assert_eq!(second.config.get("url"), Some(&json!("https://b.test")));
            assert_eq!(second.created_at, first.created_at);
            assert!(second.updated_at > first.updated_at);
        }

        it "deletes the stored config" {
            let db = migrated_db();
            let task = task_in_new_context(&db);
            db.save_webhook_config(task.id, &Map::new()).unwrap();

            db.delete_webhook_config(task.id).unwrap();

            assert!(db.load_webhook_config(task.id).unwrap().is_none());
        }
    }
}
