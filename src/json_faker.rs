use chrono::{Duration, NaiveDate};
use fake::Fake;
use fake::faker::address::en::*;
use fake::faker::company::en::*;
use fake::faker::name::en::*;
use fake::faker::number::en::*;
use rand::Rng;
use rand::seq::IndexedRandom;
use serde_json::{Value, json};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const PLAN_TYPES: &[&str] = &[
    "Medicare Part A",
    "Medicare Part B",
    "Medicaid",
    "Commercial PPO",
    "Group HMO",
    "Individual Marketplace",
    "Workers Comp",
];

fn random_date(rng: &mut impl Rng, from_year: i32, to_year: i32) -> NaiveDate {
    let start = NaiveDate::from_ymd_opt(from_year, 1, 1).unwrap_or_default();
    let end = NaiveDate::from_ymd_opt(to_year, 12, 31).unwrap_or_default();
    let span = (end - start).num_days().max(1);
    start + Duration::days(rng.random_range(0..span))
}

/// Generate one fake patient with one to three payers.
///
/// Payers use the issuer/insuredParty layout that the default schema in
/// `tests/fixtures` reads; the patient is the insured party on every payer.
pub fn fake_patient() -> Value {
    let mut rng = rand::rng();
    let first_name: String = FirstName().fake();
    let last_name: String = LastName().fake();
    let birth_date = random_date(&mut rng, 1940, 2010);
    let gender = ["M", "F", "U"].choose(&mut rng).copied().unwrap_or("U");
    let address = json!({
        "addressLine1": format!("{} {}", BuildingNumber().fake::<String>(), StreetName().fake::<String>()),
        "city": CityName().fake::<String>(),
        "state": StateAbbr().fake::<String>(),
        "postalCode": PostCode().fake::<String>(),
    });

    let payer_count = rng.random_range(1..=3);
    let payers: Vec<Value> = (0..payer_count)
        .map(|_| {
            let plan_type = PLAN_TYPES.choose(&mut rng).copied().unwrap_or("Commercial PPO");
            let effective = random_date(&mut rng, 2015, 2024);
            json!({
                "coverageId": NumberWithFormat("COV-######").fake::<String>(),
                "payPlanType": plan_type,
                "accountNumber": NumberWithFormat("^##-###-####").fake::<String>(),
                "issuer": {
                    "issuerName": CompanyName().fake::<String>(),
                    "groupName": format!("{} Employees", CompanyName().fake::<String>()),
                    "group": NumberWithFormat("G#####").fake::<String>(),
                    "planNumber": NumberWithFormat("PLN-####").fake::<String>(),
                    "planEffectiveDate": effective.to_string(),
                    "planExpirationDate": (effective + Duration::days(365)).to_string(),
                },
                "insuredParty": {
                    "firstName": first_name,
                    "lastName": last_name,
                    "middleName": Value::Null,
                    "birthDate": birth_date.to_string(),
                    "gender": gender,
                    "socialBeneficiaryIdentifier": NumberWithFormat("###-##-####").fake::<String>(),
                    "relationship": "Self",
                    "address": address,
                },
            })
        })
        .collect();

    json!({
        "patientId": NumberWithFormat("PT######").fake::<String>(),
        "coverageId": NumberWithFormat("COV-######").fake::<String>(),
        "firstName": first_name,
        "lastName": last_name,
        "birthDate": birth_date.to_string(),
        "gender": gender,
        "payers": payers,
    })
}

/// Write `n` fake patients to a JSONL file.
pub fn write_fake_patients_jsonl(path: &Path, n: usize) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for _ in 0..n {
        let json = serde_json::to_string(&fake_patient())?;
        writeln!(writer, "{}", json)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), patients = n, "Wrote fake patients");
    Ok(())
}
