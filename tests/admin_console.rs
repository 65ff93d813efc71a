use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use clinic::tenant::TenantManager;
use clinic::wire;

const PASSWORD: &str = "clinic";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("clinic_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 30 * 60_000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, clinic: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(clinic)
        .user("admin")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.as_db_error().map(|db| db.code().code()).unwrap_or("")
}

struct Seed {
    doctor: Ulid,
    patient: Ulid,
}

async fn seed(client: &Client) -> Seed {
    let specialty = Ulid::new();
    let doctor = Ulid::new();
    let patient = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO specialties (id, name) VALUES ('{specialty}', 'Cardiology');
             INSERT INTO doctors (id, license, first_name, last_name, email, specialties)
                 VALUES ('{doctor}', 'MP-1', 'Ana', 'Gómez', 'ana@clinic.example', '{specialty}');
             INSERT INTO patients (id, national_id, first_name, last_name, birth_date)
                 VALUES ('{patient}', '30111222', 'Luis', 'Pérez', '1990-05-17')"
        ))
        .await
        .unwrap();
    Seed { doctor, patient }
}

async fn book(client: &Client, seed: &Seed, start: &str) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (id, doctor_id, patient_id, start) \
             VALUES ('{id}', '{}', '{}', '{start}')",
            seed.doctor, seed.patient
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn catalog_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "main").await;
    let seed = seed(&client).await;

    let found = rows(
        &client,
        &format!("SELECT first_name, last_name, specialties FROM doctors WHERE id = '{}'", seed.doctor),
    )
    .await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("first_name"), Some("Ana"));
    assert_eq!(found[0].get("last_name"), Some("Gómez"));

    client
        .batch_execute(&format!("UPDATE patients SET email = 'luis@mail.example' WHERE id = '{}'", seed.patient))
        .await
        .unwrap();
    let found = rows(&client, "SELECT email FROM patients WHERE last_name ILIKE 'pé%'").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("email"), Some("luis@mail.example"));

    let none = rows(&client, "SELECT id FROM patients WHERE email IS NULL").await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn overlapping_booking_is_refused() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "main").await;
    let seed = seed(&client).await;

    let first = book(&client, &seed, "2026-10-16T10:00:00Z").await.unwrap();

    let err = book(&client, &seed, "2026-10-16T10:15:00Z").await.unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains(&first.to_string()), "{message}");

    // Touching windows do not overlap.
    book(&client, &seed, "2026-10-16T10:30:00Z").await.unwrap();

    // Cancelling releases the slot.
    client
        .batch_execute(&format!("UPDATE appointments SET status = 'cancelled' WHERE id = '{first}'"))
        .await
        .unwrap();
    book(&client, &seed, "2026-10-16T10:00:00Z").await.unwrap();

    let agenda = rows(
        &client,
        &format!(
            r#"SELECT start, "end", status FROM appointments WHERE doctor_id = '{}' AND status <> 'CANCELLED'"#,
            seed.doctor
        ),
    )
    .await;
    let windows: Vec<(&str, &str)> = agenda
        .iter()
        .map(|r| (r.get("start").unwrap(), r.get("end").unwrap()))
        .collect();
    assert_eq!(
        windows,
        vec![
            ("2026-10-16T10:00:00Z", "2026-10-16T10:30:00Z"),
            ("2026-10-16T10:30:00Z", "2026-10-16T11:00:00Z"),
        ]
    );
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "main").await;
    let seed = seed(&client).await;

    let err = client.batch_execute("SELECT * FROM invoices").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42P01");

    let err = client.batch_execute("SELECT shoe_size FROM patients").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42703");

    let err = client
        .batch_execute(&format!("DELETE FROM doctors WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    // Same license twice.
    let err = client
        .batch_execute(
            "INSERT INTO doctors (license, first_name, last_name, email) \
             VALUES ('MP-1', 'Otro', 'Médico', 'otro@clinic.example')",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23505");

    // A bare date is not an instant.
    let err = book(&client, &seed, "2026-10-16").await.unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client
        .batch_execute(&format!(r#"UPDATE appointments SET "end" = '2026-10-16T11:00:00Z' WHERE id = '{}'"#, Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "428C9");
}

#[tokio::test]
async fn clinics_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let north = connect(addr, "north").await;
    let south = connect(addr, "south").await;

    let seed_north = seed(&north).await;
    book(&north, &seed_north, "2026-10-16T10:00:00Z").await.unwrap();

    assert_eq!(rows(&north, "SELECT id FROM appointments").await.len(), 1);
    assert!(rows(&south, "SELECT id FROM appointments").await.is_empty());
    assert!(rows(&south, "SELECT id FROM doctors").await.is_empty());
    assert_eq!(tm.len(), 2);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "main").await;
    let seed = seed(&client).await;
    let booked = book(&client, &seed, "2026-10-16T09:00:00Z").await.unwrap();

    let doctor = seed.doctor.to_string();
    let found = client
        .query("SELECT id FROM appointments WHERE doctor_id = $1", &[&doctor])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let id: &str = found[0].get(0);
    assert_eq!(id, booked.to_string());
}

#[tokio::test]
async fn deleting_an_appointment_cascades() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "main").await;
    let seed = seed(&client).await;
    let appointment = book(&client, &seed, "2026-10-16T09:00:00Z").await.unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO reminders (appointment_id, channel, send_at) \
             VALUES ('{appointment}', 'sms', '2026-10-15T09:00:00Z');
             INSERT INTO histories (appointment_id, attended_on, diagnosis) \
             VALUES ('{appointment}', '2026-10-16', 'Healthy')"
        ))
        .await
        .unwrap();
    let reminders = rows(&client, "SELECT channel, sent FROM reminders").await;
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].get("channel"), Some("SMS"));
    assert_eq!(reminders[0].get("sent"), Some("f"));

    client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{appointment}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT id FROM reminders").await.is_empty());
    assert!(rows(&client, "SELECT id FROM histories").await.is_empty());
}
