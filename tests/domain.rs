use assert_matches::assert_matches;
use kira_csm::domain::{InternalId, Provider, SourceId};
use kira_csm::error::KiraError;
use std::str::FromStr;

#[test]
fn parse_providers() {
    assert_eq!(Provider::from_str("alphafold").unwrap(), Provider::AlphaFold);
    assert_eq!(Provider::from_str("SWISS-MODEL").unwrap(), Provider::SwissModel);
    assert_eq!(Provider::from_str("ac").unwrap(), Provider::AlphaFoldCloud);
    assert_matches!(Provider::from_str("pdb"), Err(KiraError::UnknownProvider(_)));
}

#[test]
fn parse_source_ids_per_provider() {
    let af = SourceId::parse(Provider::AlphaFold, " af-p69905-f1 ").unwrap();
    assert_eq!(af.as_str(), "AF-P69905-F1");

    let mb = SourceId::parse(Provider::ModBase, "MODEL_0123456789ABCDEF0123456789ABCDEF").unwrap();
    assert_eq!(mb.as_str(), "model_0123456789abcdef0123456789abcdef");

    let sm = SourceId::parse(Provider::SwissModel, "P69905_1_142_1a00.1").unwrap();
    assert_eq!(sm.as_str(), "P69905_1_142_1A00.1");

    assert_matches!(
        SourceId::parse(Provider::ModelArchive, "ma-../../etc"),
        Err(KiraError::InvalidSourceId { .. })
    );
    assert_matches!(
        SourceId::parse(Provider::AlphaFold, "P69905"),
        Err(KiraError::InvalidSourceId { .. })
    );
}

#[test]
fn internal_id_parsing() {
    let id: InternalId = "MA_0123456789ABCDEF01234567".parse().unwrap();
    assert_eq!(id.provider(), Provider::ModelArchive);
    assert_eq!(id.digest(), "0123456789ABCDEF01234567");

    assert_matches!(
        "ZZ_0123456789ABCDEF01234567".parse::<InternalId>(),
        Err(KiraError::InvalidInternalId(_))
    );
    assert_matches!(
        "MA_0123".parse::<InternalId>(),
        Err(KiraError::InvalidInternalId(_))
    );
}

#[test]
fn source_urls() {
    let af = SourceId::parse(Provider::AlphaFold, "AF-P69905-F1").unwrap();
    assert_eq!(
        Provider::AlphaFold.source_url(&af),
        "https://alphafold.ebi.ac.uk/entry/P69905"
    );
    let ma = SourceId::parse(Provider::ModelArchive, "ma-ornl-0001").unwrap();
    assert!(Provider::ModelArchive.source_url(&ma).ends_with("/ma-ornl-0001"));
}
