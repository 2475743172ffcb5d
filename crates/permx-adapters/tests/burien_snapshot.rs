use std::path::Path;

use permx_adapters::{fetch_provider_records, JurisdictionAdapter, ProviderContext, SourceSpec};
use permx_core::{CanonicalPermit, Jurisdiction};
use permx_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};

fn fixture_context() -> ProviderContext {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/burien");
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    ProviderContext::new(http, SnapshotStore::new(root))
}

#[tokio::test]
async fn burien_fixture_normalizes_into_canonical_permits() {
    let adapter = JurisdictionAdapter::new(Jurisdiction::Burien, SourceSpec::default_for(Jurisdiction::Burien));
    let permits = fetch_provider_records(&adapter, &fixture_context()).await.unwrap();
    assert_eq!(permits.len(), 3);

    let issued = &permits[0];
    assert_eq!(issued.permit_number, "PLN24-0042");
    assert_eq!(issued.status, "Issued");
    assert_eq!(issued.permit_type, "Building");
    assert_eq!(issued.parcel, "0623049123");
    assert_eq!(issued.applied_date, 1_710_460_800_000);
    assert_eq!(issued.issued_date, 1_717_200_000_000);
    assert_eq!(issued.selected_date(), issued.issued_date);
    assert_eq!(
        issued.detail_url,
        "https://permitsearch.mybuildingpermit.com/PermitDetails/PLN24-0042/Burien"
    );

    let in_review = &permits[1];
    assert_eq!(in_review.applied_date, 1_698_883_200_000);
    assert_eq!(in_review.issued_date, 0);
    assert_eq!(in_review.selected_date(), in_review.applied_date);

    let blank = &permits[2];
    assert_eq!(blank.applied_date, 0);
    assert!(blank.detail_url.is_empty());
    let enrichable: Vec<_> = permits.iter().filter(|p| CanonicalPermit::is_enrichable(p)).collect();
    assert_eq!(enrichable.len(), 2);
}
