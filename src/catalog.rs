//! STAC catalog records as the item type of search listings.
use crate::api::HttpClient;
use crate::model::AssetRef;
use crate::pagination::PageIterator;
use stac::Item;
use url::Url;

/// Assets of `item` for each requested type, in request order. An empty
/// `asset_types` selects every asset the item carries. Types the item does
/// not offer are skipped.
pub fn asset_refs(item: &Item, asset_types: &[String]) -> Vec<AssetRef> {
    if asset_types.is_empty() {
        return item
            .assets
            .keys()
            .map(|key| AssetRef::new(&item.id, key))
            .collect();
    }
    asset_types
        .iter()
        .filter(|asset_type| {
            let offered = item.assets.contains_key(asset_type.as_str());
            if !offered {
                tracing::debug!(item = %item.id, asset_type = %asset_type, "Asset type not offered");
            }
            offered
        })
        .map(|asset_type| AssetRef::new(&item.id, asset_type))
        .collect()
}

/// Lazily walk the search results starting at `url`.
pub fn search(client: &HttpClient, url: Url) -> PageIterator<'_, Item, HttpClient> {
    PageIterator::new(client, url)
}
